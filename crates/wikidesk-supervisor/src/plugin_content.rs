//! The main wiki's `FileSystemPaths` tiddler, which routes tiddlers carrying a sub
//! wiki's tag into that sub wiki's linked folder.

use crate::WikiError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use wikidesk_core::TIDDLERS_PATH;

pub const PLUGIN_FILE_NAME: &str = "FileSystemPaths.tid";
const PLUGIN_HEADER: &str = "title: $:/config/FileSystemPaths\ntype: text/vnd.tiddlywiki\n\n";
const RULE_PREFIX: &str = "[!is[system]tag[";
const RULE_MIDDLE: &str = "]addprefix[/]addprefix[";
const RULE_SUFFIX: &str = "]addprefix[/]addprefix[subwiki]]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubWikiRoute {
    pub tag_name: String,
    pub folder_name: String,
}

impl SubWikiRoute {
    fn to_rule(&self) -> String {
        format!(
            "{RULE_PREFIX}{}{RULE_MIDDLE}{}{RULE_SUFFIX}",
            self.tag_name, self.folder_name
        )
    }

    fn from_rule(line: &str) -> Option<Self> {
        let body = line.trim().strip_prefix(RULE_PREFIX)?.strip_suffix(RULE_SUFFIX)?;
        let (tag_name, folder_name) = body.split_once(RULE_MIDDLE)?;
        Some(Self {
            tag_name: tag_name.to_string(),
            folder_name: folder_name.to_string(),
        })
    }
}

pub fn plugin_file_path(main_wiki_path: &Path) -> PathBuf {
    main_wiki_path.join(TIDDLERS_PATH).join(PLUGIN_FILE_NAME)
}

pub fn parse_plugin_content(content: &str) -> Vec<SubWikiRoute> {
    content.lines().filter_map(SubWikiRoute::from_rule).collect()
}

pub fn render_plugin_content(routes: &[SubWikiRoute]) -> String {
    let rules: Vec<String> = routes.iter().map(SubWikiRoute::to_rule).collect();
    format!("{PLUGIN_HEADER}{}", rules.join("\n"))
}

/// Tag to folder routes currently declared by a main wiki. A missing file means none.
pub async fn get_sub_wiki_plugin_content(
    main_wiki_path: &Path,
) -> Result<Vec<SubWikiRoute>, WikiError> {
    let path = plugin_file_path(main_wiki_path);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(parse_plugin_content(&content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(WikiError::io(path, err)),
    }
}

/// Adds, replaces or removes the route of one sub wiki.
///
/// With only `new_tag` the route is added, with only `old_tag` it is removed, and
/// with both the old route is replaced. The folder name is the last component of
/// `sub_wiki_path`.
pub async fn update_sub_wiki_plugin_content(
    main_wiki_path: &Path,
    sub_wiki_path: &Path,
    new_tag: Option<&str>,
    old_tag: Option<&str>,
) -> Result<(), WikiError> {
    let Some(folder_name) = sub_wiki_path.file_name().and_then(|name| name.to_str()) else {
        return Err(WikiError::PathNotExist(sub_wiki_path.to_path_buf()));
    };
    let mut routes = get_sub_wiki_plugin_content(main_wiki_path).await?;
    let before = routes.len();

    if let Some(old_tag) = old_tag {
        routes.retain(|route| !(route.tag_name == old_tag && route.folder_name == folder_name));
    }
    if let Some(new_tag) = new_tag.filter(|tag| !tag.is_empty()) {
        let route = SubWikiRoute {
            tag_name: new_tag.to_string(),
            folder_name: folder_name.to_string(),
        };
        if !routes.contains(&route) {
            routes.push(route);
        }
    }

    let path = plugin_file_path(main_wiki_path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| WikiError::io(parent, err))?;
    }
    tokio::fs::write(&path, render_plugin_content(&routes))
        .await
        .map_err(|err| WikiError::io(&path, err))?;
    debug!(
        event = "sub_wiki_routes_written",
        path = %path.display(),
        before,
        after = routes.len()
    );
    info!(
        event = "sub_wiki_route_updated",
        folder_name = %folder_name,
        new_tag = new_tag.unwrap_or_default(),
        old_tag = old_tag.unwrap_or_default()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_parses_back_into_route() {
        let route = SubWikiRoute {
            tag_name: "private".to_string(),
            folder_name: "secret-notes".to_string(),
        };
        let rule = route.to_rule();
        assert_eq!(
            rule,
            "[!is[system]tag[private]addprefix[/]addprefix[secret-notes]addprefix[/]addprefix[subwiki]]"
        );
        assert_eq!(SubWikiRoute::from_rule(&rule), Some(route));
    }

    #[test]
    fn header_lines_are_not_routes() {
        let content = render_plugin_content(&[]);
        assert!(content.starts_with("title: $:/config/FileSystemPaths"));
        assert!(parse_plugin_content(&content).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn add_replace_and_remove_routes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let main = dir.path().join("main");
        let sub = dir.path().join("journal");

        update_sub_wiki_plugin_content(&main, &sub, Some("diary"), None)
            .await
            .expect("add");
        update_sub_wiki_plugin_content(&main, &dir.path().join("work"), Some("job"), None)
            .await
            .expect("add second");
        let routes = get_sub_wiki_plugin_content(&main).await.expect("read");
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].tag_name, "diary");
        assert_eq!(routes[0].folder_name, "journal");

        update_sub_wiki_plugin_content(&main, &sub, Some("log"), Some("diary"))
            .await
            .expect("replace");
        let routes = get_sub_wiki_plugin_content(&main).await.expect("read");
        assert_eq!(
            routes.iter().map(|r| r.tag_name.as_str()).collect::<Vec<_>>(),
            vec!["job", "log"]
        );

        update_sub_wiki_plugin_content(&main, &sub, None, Some("log"))
            .await
            .expect("remove");
        let routes = get_sub_wiki_plugin_content(&main).await.expect("read");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].folder_name, "work");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_file_has_no_routes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let routes = get_sub_wiki_plugin_content(dir.path()).await.expect("read");
        assert!(routes.is_empty());
    }
}
