//! Namespace prefixes and the item routing table.
//!
//! Tools and prompts are addressed as `<server>:<name>`. Resource URIs carry the
//! prefix in front of the scheme, `<server>:<scheme>://<path>`, so the URI's own
//! colon is never mistaken for a separator.

use std::collections::{HashMap, HashSet};

use crate::error::{McpError, McpResult};

pub const PREFIX_SEPARATOR: char = ':';
const SCHEME_SEPARATOR: &str = "://";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Tool,
    Prompt,
    Resource,
}

impl ItemKind {
    fn not_found(self, name: &str) -> McpError {
        match self {
            ItemKind::Tool => McpError::ToolNotFound(name.to_string()),
            ItemKind::Prompt => McpError::PromptNotFound(name.to_string()),
            ItemKind::Resource => McpError::ResourceNotFound(name.to_string()),
        }
    }
}

pub fn prefixed_name(server: &str, name: &str) -> String {
    format!("{}{}{}", server, PREFIX_SEPARATOR, name)
}

/// `file:///a` on `fs` becomes `fs:file:///a`.
pub fn prefixed_uri(server: &str, uri: &str) -> String {
    prefixed_name(server, uri)
}

/// Split `server:item` at the first colon. The server part must be non-empty.
pub fn split_prefixed(name: &str) -> Option<(&str, &str)> {
    let (server, item) = name.split_once(PREFIX_SEPARATOR)?;
    (!server.is_empty() && !item.is_empty()).then_some((server, item))
}

/// Recover `(server, uri)` from `server:scheme://path`.
///
/// URIs without `://` fall back to [`split_prefixed`].
pub fn split_prefixed_uri(uri: &str) -> Option<(&str, String)> {
    let Some(scheme_end) = uri.find(SCHEME_SEPARATOR) else {
        return split_prefixed(uri).map(|(server, rest)| (server, rest.to_string()));
    };
    let (server, scheme) = uri[..scheme_end].split_once(PREFIX_SEPARATOR)?;
    if server.is_empty() || scheme.is_empty() {
        return None;
    }
    Some((server, format!("{}{}", scheme, &uri[scheme_end..])))
}

/// Routes for one item kind: which server owns each bare name, and which names
/// each server exposes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ItemRoutes {
    owners: HashMap<String, String>,
    members: HashMap<String, HashSet<String>>,
}

impl ItemRoutes {
    /// Register `item` for `server`. A later registration of the same name
    /// replaces the owner; the previous owner is returned when it differs.
    pub fn register(&mut self, server: &str, item: &str) -> Option<String> {
        self.members
            .entry(server.to_string())
            .or_default()
            .insert(item.to_string());
        self.owners
            .insert(item.to_string(), server.to_string())
            .filter(|previous| previous != server)
    }

    pub fn owner(&self, item: &str) -> Option<&str> {
        self.owners.get(item).map(String::as_str)
    }

    pub fn contains(&self, server: &str, item: &str) -> bool {
        self.members
            .get(server)
            .is_some_and(|items| items.contains(item))
    }

    /// Number of distinct bare names.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.owners.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    pub tools: ItemRoutes,
    pub prompts: ItemRoutes,
    pub resources: ItemRoutes,
}

impl RoutingTable {
    pub fn routes(&self, kind: ItemKind) -> &ItemRoutes {
        match kind {
            ItemKind::Tool => &self.tools,
            ItemKind::Prompt => &self.prompts,
            ItemKind::Resource => &self.resources,
        }
    }

    pub fn routes_mut(&mut self, kind: ItemKind) -> &mut ItemRoutes {
        match kind {
            ItemKind::Tool => &mut self.tools,
            ItemKind::Prompt => &mut self.prompts,
            ItemKind::Resource => &mut self.resources,
        }
    }
}

/// Where a request should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub server: String,
    pub item: String,
}

/// Resolves request names against a routing table and the connected servers.
pub struct Resolver<'a> {
    servers: &'a [String],
    table: &'a RoutingTable,
    require_prefix: bool,
}

impl<'a> Resolver<'a> {
    /// `servers` are the connected server names in discovery order. A prefix
    /// is required when namespacing is on and more than one server is connected.
    pub fn new(servers: &'a [String], table: &'a RoutingTable, use_namespace_prefix: bool) -> Self {
        Self {
            servers,
            table,
            require_prefix: use_namespace_prefix && servers.len() > 1,
        }
    }

    pub fn requires_prefix(&self) -> bool {
        self.require_prefix
    }

    fn known_server(&self, prefix: &str) -> Option<&'a str> {
        self.servers
            .iter()
            .find(|s| s.eq_ignore_ascii_case(prefix))
            .map(String::as_str)
    }

    pub fn resolve(&self, kind: ItemKind, name: &str) -> McpResult<Route> {
        let routes = self.table.routes(kind);

        let explicit = match kind {
            ItemKind::Resource => split_prefixed_uri(name),
            ItemKind::Tool | ItemKind::Prompt => {
                split_prefixed(name).map(|(server, item)| (server, item.to_string()))
            }
        };

        if let Some((prefix, item)) = explicit {
            if let Some(server) = self.known_server(prefix) {
                if routes.contains(server, &item) {
                    return Ok(Route {
                        server: server.to_string(),
                        item,
                    });
                }
                return Err(kind.not_found(name));
            }
            if self.require_prefix {
                return Err(McpError::ServerNotFound(prefix.to_string()));
            }
        }

        if self.require_prefix {
            return Err(McpError::AmbiguousName {
                name: name.to_string(),
                servers: self.servers.to_vec(),
            });
        }

        routes
            .owner(name)
            .map(|server| Route {
                server: server.to_string(),
                item: name.to_string(),
            })
            .ok_or_else(|| kind.not_found(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoutingTable {
        let mut table = RoutingTable::default();
        table.tools.register("fs", "read_file");
        table.tools.register("fs", "echo");
        table.tools.register("git", "echo");
        table.tools.register("git", "ns:tool");
        table.prompts.register("git", "commit_msg");
        table.resources.register("fs", "file:///etc/hosts");
        table
    }

    fn servers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_prefixed() {
        assert_eq!(split_prefixed("fs:read"), Some(("fs", "read")));
        assert_eq!(split_prefixed("fs:a:b"), Some(("fs", "a:b")));
        assert_eq!(split_prefixed(":read"), None);
        assert_eq!(split_prefixed("read"), None);
    }

    #[test]
    fn test_split_prefixed_uri() {
        assert_eq!(
            split_prefixed_uri("fs:file:///etc/hosts"),
            Some(("fs", "file:///etc/hosts".to_string()))
        );
        assert_eq!(split_prefixed_uri("file:///etc/hosts"), None);
        assert_eq!(split_prefixed_uri(":file:///x"), None);
        assert_eq!(
            split_prefixed_uri("db:urn:item"),
            Some(("db", "urn:item".to_string()))
        );
        assert_eq!(
            prefixed_uri("fs", "file:///etc/hosts"),
            "fs:file:///etc/hosts"
        );
    }

    #[test]
    fn test_register_last_writer_wins() {
        let mut routes = ItemRoutes::default();
        assert_eq!(routes.register("a", "shared"), None);
        assert_eq!(routes.register("b", "shared"), Some("a".to_string()));
        assert_eq!(routes.register("b", "shared"), None);
        assert_eq!(routes.owner("shared"), Some("b"));
        assert!(routes.contains("a", "shared"));
        assert_eq!(routes.len(), 1);
    }

    #[test]
    fn test_ambiguous_without_prefix() {
        let table = table();
        let names = servers(&["fs", "git"]);
        let resolver = Resolver::new(&names, &table, true);

        let err = resolver.resolve(ItemKind::Tool, "echo").unwrap_err();
        assert!(matches!(err, McpError::AmbiguousName { .. }));

        let route = resolver.resolve(ItemKind::Tool, "git:echo").unwrap();
        assert_eq!(route.server, "git");
        assert_eq!(route.item, "echo");

        let route = resolver.resolve(ItemKind::Tool, "fs:echo").unwrap();
        assert_eq!(route.server, "fs");
    }

    #[test]
    fn test_unknown_prefix_when_required() {
        let table = table();
        let names = servers(&["fs", "git"]);
        let resolver = Resolver::new(&names, &table, true);
        assert!(matches!(
            resolver.resolve(ItemKind::Tool, "ghost:echo"),
            Err(McpError::ServerNotFound(s)) if s == "ghost"
        ));
        assert!(matches!(
            resolver.resolve(ItemKind::Tool, "fs:missing"),
            Err(McpError::ToolNotFound(_))
        ));
    }

    #[test]
    fn test_prefix_matches_case_insensitively() {
        let table = table();
        let names = servers(&["fs", "git"]);
        let resolver = Resolver::new(&names, &table, true);
        let route = resolver.resolve(ItemKind::Tool, "GIT:echo").unwrap();
        assert_eq!(route.server, "git");
    }

    #[test]
    fn test_single_server_accepts_both_forms() {
        let table = table();
        let names = servers(&["fs"]);
        let resolver = Resolver::new(&names, &table, true);
        assert!(!resolver.requires_prefix());

        let bare = resolver.resolve(ItemKind::Tool, "read_file").unwrap();
        let prefixed = resolver.resolve(ItemKind::Tool, "fs:read_file").unwrap();
        assert_eq!(bare, prefixed);
    }

    #[test]
    fn test_colon_in_item_name_without_prefixing() {
        let table = table();
        let names = servers(&["fs", "git"]);
        let resolver = Resolver::new(&names, &table, false);

        // "ns" is not a server, so the whole string is the item name.
        let route = resolver.resolve(ItemKind::Tool, "ns:tool").unwrap();
        assert_eq!(route.server, "git");
        assert_eq!(route.item, "ns:tool");

        // Bare names fall back to the last registered owner.
        assert_eq!(resolver.resolve(ItemKind::Tool, "echo").unwrap().server, "git");
    }

    #[test]
    fn test_resource_and_prompt_resolution() {
        let table = table();
        let names = servers(&["fs", "git"]);
        let resolver = Resolver::new(&names, &table, true);

        let route = resolver
            .resolve(ItemKind::Resource, "fs:file:///etc/hosts")
            .unwrap();
        assert_eq!(route.server, "fs");
        assert_eq!(route.item, "file:///etc/hosts");

        assert!(matches!(
            resolver.resolve(ItemKind::Resource, "file:///etc/hosts"),
            Err(McpError::AmbiguousName { .. })
        ));
        assert!(matches!(
            resolver.resolve(ItemKind::Prompt, "fs:commit_msg"),
            Err(McpError::PromptNotFound(_))
        ));
    }
}
