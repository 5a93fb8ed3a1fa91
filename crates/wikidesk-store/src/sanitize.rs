use std::collections::BTreeMap;
use tracing::debug;
use wikidesk_core::{default_home_url, uses_internal_scheme, workspace_sorter, Workspace};

/// Issues the one-time admin token stored on workspaces that enable token auth.
pub trait AuthTokenIssuer: Send + Sync {
    fn one_time_admin_token(&self, workspace_id: &str) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomTokenIssuer;

impl AuthTokenIssuer for RandomTokenIssuer {
    fn one_time_admin_token(&self, _workspace_id: &str) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

/// Main workspace of a sub workspace, by id first and by folder path for legacy records.
pub fn find_main_workspace<'a>(
    sub: &Workspace,
    known: &'a BTreeMap<String, Workspace>,
) -> Option<&'a Workspace> {
    if !sub.is_sub_wiki {
        return None;
    }
    if let Some(main_id) = sub.main_wiki_id.as_deref().filter(|id| !id.is_empty()) {
        return known.get(main_id);
    }
    let main_path = sub.main_wiki_to_link.as_deref()?;
    let mut candidates: Vec<&Workspace> = known.values().collect();
    candidates.sort_by(|a, b| workspace_sorter(a, b));
    candidates
        .into_iter()
        .find(|candidate| candidate.wiki_folder_location == main_path)
}

/// Makes a record consistent before it is persisted. Applying it twice equals applying it once.
///
/// Field defaults (storage service, backup, plugin exclusions, HTTP API) are filled in
/// when the record is deserialized, so only the repairs remain here.
pub fn sanitize_workspace(
    mut workspace: Workspace,
    known: &BTreeMap<String, Workspace>,
    tokens: &dyn AuthTokenIssuer,
) -> Workspace {
    if workspace.is_sub_wiki
        && workspace
            .main_wiki_id
            .as_deref()
            .map_or(true, str::is_empty)
    {
        if let Some(main) = find_main_workspace(&workspace, known) {
            debug!(
                event = "workspace_main_id_backfilled",
                workspace_id = %workspace.id,
                main_wiki_id = %main.id
            );
            workspace.main_wiki_id = Some(main.id.clone());
        }
    }

    if let Some(tag) = workspace.tag_name.as_mut() {
        if tag.ends_with('\n') {
            *tag = tag.replace('\n', "");
        }
    }

    if !workspace
        .last_url
        .as_deref()
        .is_some_and(uses_internal_scheme)
    {
        workspace.last_url = None;
    }
    if !uses_internal_scheme(&workspace.home_url) {
        workspace.home_url = default_home_url(&workspace.id);
    }

    if workspace.token_auth
        && workspace
            .auth_token
            .as_deref()
            .map_or(true, str::is_empty)
    {
        workspace.auth_token = Some(tokens.one_time_admin_token(&workspace.id));
    }

    workspace
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedToken;

    impl AuthTokenIssuer for FixedToken {
        fn one_time_admin_token(&self, workspace_id: &str) -> String {
            format!("token-{workspace_id}")
        }
    }

    fn known_main() -> BTreeMap<String, Workspace> {
        let main = Workspace {
            id: "main".to_string(),
            wiki_folder_location: "/wikis/main".to_string(),
            home_url: default_home_url("main"),
            ..Workspace::default()
        };
        BTreeMap::from([(main.id.clone(), main)])
    }

    fn legacy_sub() -> Workspace {
        Workspace {
            id: "sub".to_string(),
            is_sub_wiki: true,
            main_wiki_to_link: Some("/wikis/main".to_string()),
            wiki_folder_location: "/wikis/sub".to_string(),
            tag_name: Some("Private\n".to_string()),
            home_url: "http://localhost:5212".to_string(),
            last_url: Some("http://localhost:5212/#Index".to_string()),
            token_auth: true,
            ..Workspace::default()
        }
    }

    #[test]
    fn legacy_sub_workspace_is_repaired() {
        let sanitized = sanitize_workspace(legacy_sub(), &known_main(), &FixedToken);
        assert_eq!(sanitized.main_wiki_id.as_deref(), Some("main"));
        assert_eq!(sanitized.tag_name.as_deref(), Some("Private"));
        assert_eq!(sanitized.last_url, None);
        assert_eq!(sanitized.home_url, "wikidesk://sub");
        assert_eq!(sanitized.auth_token.as_deref(), Some("token-sub"));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let known = known_main();
        let once = sanitize_workspace(legacy_sub(), &known, &RandomTokenIssuer);
        let twice = sanitize_workspace(once.clone(), &known, &RandomTokenIssuer);
        assert_eq!(once, twice);
    }

    #[test]
    fn internal_urls_are_kept() {
        let workspace = Workspace {
            id: "w".to_string(),
            home_url: "wikidesk://w".to_string(),
            last_url: Some("wikidesk://w/#GettingStarted".to_string()),
            ..Workspace::default()
        };
        let sanitized = sanitize_workspace(workspace.clone(), &BTreeMap::new(), &FixedToken);
        assert_eq!(sanitized, workspace);
    }

    #[test]
    fn unknown_main_path_leaves_main_id_empty() {
        let mut sub = legacy_sub();
        sub.main_wiki_to_link = Some("/elsewhere".to_string());
        let sanitized = sanitize_workspace(sub, &known_main(), &FixedToken);
        assert_eq!(sanitized.main_wiki_id, None);
    }
}
