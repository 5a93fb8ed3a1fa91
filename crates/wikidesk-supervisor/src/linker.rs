use crate::WikiError;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use wikidesk_core::{SUB_WIKI_LINK_FOLDER, TIDDLERS_PATH};

/// Where the link to a sub wiki named `folder_name` lives inside a main wiki.
pub fn sub_wiki_link_path(main_wiki_path: &Path, folder_name: &str) -> PathBuf {
    main_wiki_path
        .join(TIDDLERS_PATH)
        .join(SUB_WIKI_LINK_FOLDER)
        .join(folder_name)
}

/// Links `sub_wiki_path` into the main wiki's content tree, replacing a stale link.
pub async fn link_wiki(
    main_wiki_path: &Path,
    folder_name: &str,
    sub_wiki_path: &Path,
) -> Result<PathBuf, WikiError> {
    let link_path = sub_wiki_link_path(main_wiki_path, folder_name);
    let link_error = |source: io::Error| WikiError::Link {
        sub_wiki_path: sub_wiki_path.to_path_buf(),
        link_path: link_path.clone(),
        source,
    };

    remove_link(&link_path).await.map_err(link_error)?;
    if let Some(parent) = link_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(link_error)?;
    }
    create_dir_link(sub_wiki_path, &link_path)
        .await
        .map_err(link_error)?;
    info!(
        event = "sub_wiki_linked",
        sub_wiki_path = %sub_wiki_path.display(),
        link_path = %link_path.display()
    );
    Ok(link_path)
}

/// Removes the link to a sub wiki, leaving the sub wiki itself untouched.
pub async fn unlink_wiki(main_wiki_path: &Path, folder_name: &str) -> Result<(), WikiError> {
    let link_path = sub_wiki_link_path(main_wiki_path, folder_name);
    remove_link(&link_path)
        .await
        .map_err(|err| WikiError::io(&link_path, err))
}

/// Removes whatever sits at `link_path`. A missing entry is not an error.
async fn remove_link(link_path: &Path) -> io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(link_path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    debug!(event = "sub_wiki_link_remove", link_path = %link_path.display());
    let result = if metadata.is_symlink() || metadata.is_file() {
        tokio::fs::remove_file(link_path).await
    } else {
        tokio::fs::remove_dir_all(link_path).await
    };
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        #[cfg(windows)]
        Err(_) if metadata.is_symlink() => tokio::fs::remove_dir(link_path).await,
        other => other,
    }
}

#[cfg(unix)]
async fn create_dir_link(target: &Path, link_path: &Path) -> io::Result<()> {
    tokio::fs::symlink(target, link_path).await
}

#[cfg(windows)]
async fn create_dir_link(target: &Path, link_path: &Path) -> io::Result<()> {
    tokio::fs::symlink_dir(target, link_path).await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn link_replaces_stale_link() {
        let dir = tempfile::tempdir().expect("tempdir");
        let main = dir.path().join("main");
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        std::fs::create_dir_all(&first).expect("first");
        std::fs::create_dir_all(&second).expect("second");
        std::fs::write(second.join("note.tid"), "title: note").expect("note");

        let link = link_wiki(&main, "notes", &first).await.expect("link first");
        assert_eq!(std::fs::read_link(&link).expect("read link"), first);

        link_wiki(&main, "notes", &second).await.expect("relink");
        assert_eq!(std::fs::read_link(&link).expect("read link"), second);
        assert!(link.join("note.tid").exists());
        assert!(first.exists());

        unlink_wiki(&main, "notes").await.expect("unlink");
        assert!(std::fs::symlink_metadata(&link).is_err());
        assert!(second.join("note.tid").exists());
        unlink_wiki(&main, "notes").await.expect("unlink twice");
    }

    #[test]
    fn link_path_is_under_tiddlers() {
        let path = sub_wiki_link_path(Path::new("/wikis/main"), "journal");
        assert_eq!(path, PathBuf::from("/wikis/main/tiddlers/subwiki/journal"));
    }
}
