use crate::collaborators::{GitService, GitUserInfo};
use crate::linker::{link_wiki, unlink_wiki};
use crate::plugin_content::update_sub_wiki_plugin_content;
use crate::WikiError;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use wikidesk_core::{Workspace, TIDDLERS_PATH};

pub const WIKI_INFO_FILE: &str = "tiddlywiki.info";

/// Creates, clones, checks and removes wiki folders on disk.
pub struct WikiFolders {
    template_folder: Option<PathBuf>,
    git: Arc<dyn GitService>,
}

impl WikiFolders {
    pub fn new(template_folder: Option<PathBuf>, git: Arc<dyn GitService>) -> Self {
        Self {
            template_folder,
            git,
        }
    }

    /// Copies the wiki template into `parent/folder_name`.
    pub async fn copy_wiki_template(
        &self,
        parent: &Path,
        folder_name: &str,
    ) -> Result<PathBuf, WikiError> {
        self.create_wiki(parent, folder_name)
            .await
            .map_err(|err| WikiError::CopyWikiTemplate {
                parent: parent.to_path_buf(),
                folder_name: folder_name.to_string(),
                message: err.to_string(),
            })
    }

    /// Creates (unless `only_link`) an empty sub wiki folder, links it into the main
    /// wiki and registers its tag route.
    pub async fn create_sub_wiki(
        &self,
        parent: &Path,
        folder_name: &str,
        main_wiki_path: &Path,
        tag_name: Option<&str>,
        only_link: bool,
    ) -> Result<PathBuf, WikiError> {
        let new_wiki_path = parent.join(folder_name);
        require_exists(parent).await?;
        if !only_link {
            if path_exists(&new_wiki_path).await {
                return Err(WikiError::WikiExisted(new_wiki_path));
            }
            tokio::fs::create_dir_all(&new_wiki_path)
                .await
                .map_err(|source| WikiError::CantCreateFolder {
                    path: new_wiki_path.clone(),
                    source,
                })?;
        }
        link_wiki(main_wiki_path, folder_name, &new_wiki_path).await?;
        self.register_tag(main_wiki_path, &new_wiki_path, tag_name)
            .await?;
        info!(
            event = "sub_wiki_created",
            path = %new_wiki_path.display(),
            only_link
        );
        Ok(new_wiki_path)
    }

    /// Removes a wiki folder, and its link inside `main_wiki_to_unlink` if given.
    /// With `only_remove_link` the folder itself is kept.
    pub async fn remove_wiki(
        &self,
        wiki_path: &Path,
        main_wiki_to_unlink: Option<&Path>,
        only_remove_link: bool,
    ) -> Result<(), WikiError> {
        if let Some(main_wiki_path) = main_wiki_to_unlink {
            let folder_name = folder_name_of(wiki_path)?;
            unlink_wiki(main_wiki_path, folder_name).await?;
        }
        if !only_remove_link {
            match tokio::fs::remove_dir_all(wiki_path).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(WikiError::io(wiki_path, err)),
            }
        }
        info!(
            event = "wiki_removed",
            path = %wiki_path.display(),
            only_remove_link
        );
        Ok(())
    }

    /// Checks that `wiki_path` exists and, for a main wiki, that it holds a wiki info
    /// file and a tiddlers folder.
    pub async fn ensure_wiki_exist(
        &self,
        wiki_path: &Path,
        should_be_main_wiki: bool,
    ) -> Result<(), WikiError> {
        require_exists(wiki_path).await?;
        if !should_be_main_wiki {
            return Ok(());
        }
        for required in [WIKI_INFO_FILE, TIDDLERS_PATH] {
            let missing = wiki_path.join(required);
            if !path_exists(&missing).await {
                return Err(WikiError::NotAWikiFolder {
                    path: wiki_path.to_path_buf(),
                    missing,
                });
            }
        }
        Ok(())
    }

    pub async fn check_wiki_exist(
        &self,
        workspace: &Workspace,
        should_be_main_wiki: bool,
    ) -> Result<(), WikiError> {
        let location = workspace.wiki_folder_location.as_str();
        if location.is_empty() || !Path::new(location).is_absolute() {
            error!(
                event = "wiki_folder_not_absolute",
                workspace_id = %workspace.id,
                location = %location
            );
            return Err(WikiError::NeedAbsoluteWikiPath(location.to_string()));
        }
        self.ensure_wiki_exist(Path::new(location), should_be_main_wiki)
            .await
            .inspect_err(|err| {
                error!(
                    event = "wiki_folder_missing",
                    workspace_id = %workspace.id,
                    location = %location,
                    error = %err
                );
            })
    }

    pub async fn clone_wiki(
        &self,
        parent: &Path,
        folder_name: &str,
        remote_url: &str,
        user: &GitUserInfo,
    ) -> Result<PathBuf, WikiError> {
        let new_wiki_path = self.prepare_clone_target(parent, folder_name).await?;
        self.git.clone_repo(remote_url, &new_wiki_path, user).await?;
        info!(event = "wiki_cloned", path = %new_wiki_path.display());
        Ok(new_wiki_path)
    }

    pub async fn clone_sub_wiki(
        &self,
        parent: &Path,
        folder_name: &str,
        main_wiki_path: &Path,
        remote_url: &str,
        user: &GitUserInfo,
        tag_name: Option<&str>,
    ) -> Result<PathBuf, WikiError> {
        let new_wiki_path = self.prepare_clone_target(parent, folder_name).await?;
        self.git.clone_repo(remote_url, &new_wiki_path, user).await?;
        link_wiki(main_wiki_path, folder_name, &new_wiki_path).await?;
        self.register_tag(main_wiki_path, &new_wiki_path, tag_name)
            .await?;
        info!(event = "sub_wiki_cloned", path = %new_wiki_path.display());
        Ok(new_wiki_path)
    }

    async fn create_wiki(&self, parent: &Path, folder_name: &str) -> Result<PathBuf, WikiError> {
        let new_wiki_path = parent.join(folder_name);
        require_exists(parent).await?;
        let template = match &self.template_folder {
            Some(template) if path_exists(template).await => template.clone(),
            Some(template) => return Err(WikiError::WikiTemplateMissing(template.clone())),
            None => return Err(WikiError::WikiTemplateMissing(PathBuf::new())),
        };
        if path_exists(&new_wiki_path).await {
            return Err(WikiError::WikiExisted(new_wiki_path));
        }
        let target = new_wiki_path.clone();
        tokio::task::spawn_blocking(move || copy_template(&template, &target))
            .await
            .map_err(|err| WikiError::CantCreateFolder {
                path: new_wiki_path.clone(),
                source: io::Error::other(err.to_string()),
            })?
            .map_err(|source| WikiError::CantCreateFolder {
                path: new_wiki_path.clone(),
                source,
            })?;
        info!(event = "wiki_template_copied", path = %new_wiki_path.display());
        Ok(new_wiki_path)
    }

    async fn prepare_clone_target(
        &self,
        parent: &Path,
        folder_name: &str,
    ) -> Result<PathBuf, WikiError> {
        let new_wiki_path = parent.join(folder_name);
        require_exists(parent).await?;
        if path_exists(&new_wiki_path).await {
            return Err(WikiError::WikiExisted(new_wiki_path));
        }
        tokio::fs::create_dir(&new_wiki_path)
            .await
            .map_err(|source| WikiError::CantCreateFolder {
                path: new_wiki_path.clone(),
                source,
            })?;
        Ok(new_wiki_path)
    }

    async fn register_tag(
        &self,
        main_wiki_path: &Path,
        sub_wiki_path: &Path,
        tag_name: Option<&str>,
    ) -> Result<(), WikiError> {
        match tag_name.filter(|tag| !tag.is_empty()) {
            Some(tag) => {
                update_sub_wiki_plugin_content(main_wiki_path, sub_wiki_path, Some(tag), None).await
            }
            None => Ok(()),
        }
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn require_exists(path: &Path) -> Result<(), WikiError> {
    if path_exists(path).await {
        Ok(())
    } else {
        Err(WikiError::PathNotExist(path.to_path_buf()))
    }
}

fn folder_name_of(path: &Path) -> Result<&str, WikiError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| WikiError::PathNotExist(path.to_path_buf()))
}

/// Recursive copy that leaves out `.git` entries, so a template checked out as a
/// submodule does not drag its repository along.
fn copy_template(source: &Path, target: &Path) -> io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        if from.to_string_lossy().ends_with(".git") {
            continue;
        }
        let to = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_template(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NoGit;

    fn folders(template: Option<PathBuf>) -> WikiFolders {
        WikiFolders::new(template, Arc::new(NoGit))
    }

    fn write_template(root: &Path) -> PathBuf {
        let template = root.join("template");
        std::fs::create_dir_all(template.join("tiddlers")).expect("tiddlers");
        std::fs::create_dir_all(template.join(".git")).expect(".git");
        std::fs::write(template.join(".git/HEAD"), "ref").expect("head");
        std::fs::write(template.join(".gitignore"), "subwiki").expect("gitignore");
        std::fs::write(template.join(WIKI_INFO_FILE), "{}").expect("info");
        std::fs::write(template.join("tiddlers/Index.tid"), "title: Index").expect("index");
        template
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn template_copy_skips_git_folder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let template = write_template(dir.path());
        let folders = folders(Some(template));

        let wiki = folders
            .copy_wiki_template(dir.path(), "notes")
            .await
            .expect("copy");
        assert!(wiki.join("tiddlers/Index.tid").exists());
        assert!(wiki.join(".gitignore").exists());
        assert!(!wiki.join(".git").exists());
        folders.ensure_wiki_exist(&wiki, true).await.expect("main wiki");

        let err = folders
            .copy_wiki_template(dir.path(), "notes")
            .await
            .expect_err("second copy");
        assert!(matches!(err, WikiError::CopyWikiTemplate { .. }));
        assert!(err.to_string().contains("wiki already exists"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_template_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = folders(Some(dir.path().join("nowhere")))
            .copy_wiki_template(dir.path(), "notes")
            .await
            .expect_err("missing template");
        assert!(err.to_string().contains("wiki template is missing"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn plain_folder_is_not_a_main_wiki() {
        let dir = tempfile::tempdir().expect("tempdir");
        let folders = folders(None);
        folders
            .ensure_wiki_exist(dir.path(), false)
            .await
            .expect("exists");
        let err = folders
            .ensure_wiki_exist(dir.path(), true)
            .await
            .expect_err("not a wiki");
        assert!(matches!(err, WikiError::NotAWikiFolder { .. }));
        let err = folders
            .ensure_wiki_exist(&dir.path().join("gone"), false)
            .await
            .expect_err("missing");
        assert!(matches!(err, WikiError::PathNotExist(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relative_workspace_folder_is_rejected() {
        let workspace = Workspace {
            id: "w1".to_string(),
            wiki_folder_location: "wikis/notes".to_string(),
            ..Workspace::default()
        };
        let err = folders(None)
            .check_wiki_exist(&workspace, true)
            .await
            .expect_err("relative");
        assert!(matches!(err, WikiError::NeedAbsoluteWikiPath(_)));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sub_wiki_create_and_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let main = dir.path().join("main");
        std::fs::create_dir_all(main.join("tiddlers")).expect("main");
        let folders = folders(None);

        let sub = folders
            .create_sub_wiki(dir.path(), "journal", &main, Some("diary"), false)
            .await
            .expect("create sub wiki");
        let link = main.join("tiddlers/subwiki/journal");
        assert!(std::fs::symlink_metadata(&link).expect("link").is_symlink());
        let plugin = std::fs::read_to_string(main.join("tiddlers/FileSystemPaths.tid"))
            .expect("plugin file");
        assert!(plugin.contains("tag[diary]"));

        folders
            .remove_wiki(&sub, Some(&main), true)
            .await
            .expect("unlink");
        assert!(std::fs::symlink_metadata(&link).is_err());
        assert!(sub.exists());

        folders.remove_wiki(&sub, None, false).await.expect("remove");
        assert!(!sub.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clone_without_git_backend_fails_after_creating_folder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = folders(None)
            .clone_wiki(dir.path(), "remote", "https://example.com/wiki.git", &GitUserInfo::default())
            .await
            .expect_err("no git");
        assert!(matches!(err, WikiError::Collaborator { collaborator: "git", .. }));
        assert!(dir.path().join("remote").exists());
    }
}
