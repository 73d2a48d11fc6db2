//! Per-scope geolocation settings and the rules for choosing between them.
//!
//! Two scope kinds exist: the server scope (main server or a virtual host) and
//! the directory scope (a `<Directory>` or `<Location>` section). Both embed
//! the same [`ScopeConfig`]; the wrapper types only record which role a value
//! plays so call sites cannot confuse them.

use camino::{Utf8Path, Utf8PathBuf};

use crate::record::FieldPath;

/// A user-declared mapping from a record field to a request variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldBinding {
    pub path: FieldPath,
    pub variable: String,
}

/// Settings for one configuration scope.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeConfig {
    pub enabled: bool,
    pub database: Option<Utf8PathBuf>,
    /// Custom bindings in declaration order.
    pub bindings: Vec<FieldBinding>,
}

impl ScopeConfig {
    /// Append a custom binding. Declaring the same variable twice is allowed;
    /// bindings are applied in order, so the later one wins.
    pub fn add_binding(&mut self, path: FieldPath, variable: impl Into<String>) {
        self.bindings.push(FieldBinding {
            path,
            variable: variable.into(),
        });
    }

    /// The database path, if this scope is enabled and has one.
    pub fn active_database(&self) -> Option<&Utf8Path> {
        if self.enabled {
            self.database.as_deref()
        } else {
            None
        }
    }
}

/// Scope settings for the main server or a virtual host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerConfig {
    pub scope: ScopeConfig,
}

/// Scope settings for a directory or location section.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryConfig {
    pub scope: ScopeConfig,
}

impl DirectoryConfig {
    /// Merge a more specific section over its parent.
    ///
    /// The child replaces the parent entirely: nothing, including custom
    /// bindings, is inherited from the enclosing section.
    pub fn merge(_parent: &DirectoryConfig, child: &DirectoryConfig) -> DirectoryConfig {
        child.clone()
    }
}

/// Pick the scope that applies to a request.
///
/// An enabled directory scope wins. A disabled directory scope does not stop
/// the server scope from being consulted. Returns `None` when neither is
/// enabled.
pub fn resolve_scope<'a>(
    server: &'a ServerConfig,
    directory: Option<&'a DirectoryConfig>,
) -> Option<&'a ScopeConfig> {
    match directory {
        Some(dir) if dir.scope.enabled => Some(&dir.scope),
        _ if server.scope.enabled => Some(&server.scope),
        _ => None,
    }
}

/// The kind of section a directory scope was declared in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionKind {
    /// `<Directory path>`: matched against the mapped filesystem path.
    Directory,
    /// `<Location prefix>`: matched against the request URI path.
    Location,
}

/// A declared directory-scope section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub kind: SectionKind,
    pub pattern: String,
    pub config: DirectoryConfig,
}

impl Section {
    fn matches(&self, uri: &str, filename: Option<&Utf8Path>) -> bool {
        match self.kind {
            SectionKind::Location => location_matches(&self.pattern, uri),
            SectionKind::Directory => {
                filename.is_some_and(|f| f.starts_with(Utf8Path::new(&self.pattern)))
            }
        }
    }
}

/// `/private` matches `/private`, `/private/` and `/private/x` but not `/privateer`.
fn location_matches(prefix: &str, uri: &str) -> bool {
    match uri.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

/// Server scope plus the sections declared inside it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerContext {
    pub server: ServerConfig,
    pub sections: Vec<Section>,
}

/// A `<VirtualHost>` block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualHost {
    pub names: Vec<String>,
    pub context: ServerContext,
}

impl VirtualHost {
    fn serves(&self, host: &str) -> bool {
        self.names.iter().any(|name| name.eq_ignore_ascii_case(host))
    }
}

/// The whole loaded configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleConfig {
    pub main: ServerContext,
    pub virtual_hosts: Vec<VirtualHost>,
}

/// The configuration that applies to one request.
#[derive(Clone, Debug)]
pub struct RequestScopes<'a> {
    pub server: &'a ServerConfig,
    pub directory: Option<DirectoryConfig>,
}

impl RequestScopes<'_> {
    pub fn resolve(&self) -> Option<&ScopeConfig> {
        resolve_scope(self.server, self.directory.as_ref())
    }
}

impl ModuleConfig {
    fn virtual_host(&self, host: Option<&str>) -> Option<&VirtualHost> {
        let host = strip_port(host?);
        self.virtual_hosts.iter().find(|vhost| vhost.serves(host))
    }

    /// The server scope for a request addressed to `host`.
    ///
    /// A matching virtual host always uses its own settings, starting from
    /// disabled; nothing is inherited from the main server.
    pub fn server_for(&self, host: Option<&str>) -> &ServerConfig {
        match self.virtual_host(host) {
            Some(vhost) => &vhost.context.server,
            None => &self.main.server,
        }
    }

    /// The folded directory scope for a request, if any section matches.
    ///
    /// Directory sections apply shortest path first, then location sections
    /// in declaration order; the main server's sections come before the
    /// virtual host's.
    pub fn directory_for(
        &self,
        host: Option<&str>,
        uri: &str,
        filename: Option<&Utf8Path>,
    ) -> Option<DirectoryConfig> {
        let mut contexts = vec![&self.main];
        if let Some(vhost) = self.virtual_host(host) {
            contexts.push(&vhost.context);
        }

        let mut directories: Vec<&Section> = contexts
            .iter()
            .flat_map(|ctx| ctx.sections.iter())
            .filter(|s| s.kind == SectionKind::Directory && s.matches(uri, filename))
            .collect();
        // stable: equal lengths keep declaration order
        directories.sort_by_key(|s| s.pattern.len());

        let locations = contexts
            .iter()
            .flat_map(|ctx| ctx.sections.iter())
            .filter(|s| s.kind == SectionKind::Location && s.matches(uri, filename));

        directories
            .into_iter()
            .chain(locations)
            .fold(None, |acc: Option<DirectoryConfig>, section| {
                Some(match acc {
                    Some(parent) => DirectoryConfig::merge(&parent, &section.config),
                    None => section.config.clone(),
                })
            })
    }

    /// Both scopes that apply to a request.
    pub fn scopes_for(
        &self,
        host: Option<&str>,
        uri: &str,
        filename: Option<&Utf8Path>,
    ) -> RequestScopes<'_> {
        RequestScopes {
            server: self.server_for(host),
            directory: self.directory_for(host, uri, filename),
        }
    }

    /// Every database path referenced by an enabled scope, deduplicated.
    pub fn database_paths(&self) -> Vec<&Utf8Path> {
        let contexts = std::iter::once(&self.main)
            .chain(self.virtual_hosts.iter().map(|v| &v.context));
        let mut paths: Vec<&Utf8Path> = Vec::new();
        for ctx in contexts {
            let scopes = std::iter::once(&ctx.server.scope)
                .chain(ctx.sections.iter().map(|s| &s.config.scope));
            for scope in scopes {
                if let Some(path) = scope.active_database() {
                    if !paths.contains(&path) {
                        paths.push(path);
                    }
                }
            }
        }
        paths
    }
}

pub(crate) fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(enabled: bool, db: &str) -> ScopeConfig {
        ScopeConfig {
            enabled,
            database: Some(Utf8PathBuf::from(db)),
            bindings: Vec::new(),
        }
    }

    fn server(enabled: bool) -> ServerConfig {
        ServerConfig {
            scope: scope(enabled, "/srv/server.mmdb"),
        }
    }

    fn directory(enabled: bool) -> DirectoryConfig {
        DirectoryConfig {
            scope: scope(enabled, "/srv/dir.mmdb"),
        }
    }

    #[test]
    fn enabled_directory_wins_over_any_server() {
        for server_enabled in [true, false] {
            let srv = server(server_enabled);
            let dir = directory(true);
            let resolved = resolve_scope(&srv, Some(&dir)).unwrap();
            assert_eq!(resolved.database.as_deref(), Some(Utf8Path::new("/srv/dir.mmdb")));
        }
    }

    #[test]
    fn disabled_directory_falls_back_to_server() {
        let srv = server(true);
        let dir = directory(false);
        let resolved = resolve_scope(&srv, Some(&dir)).unwrap();
        assert_eq!(resolved.database.as_deref(), Some(Utf8Path::new("/srv/server.mmdb")));
    }

    #[test]
    fn nothing_enabled_resolves_to_none() {
        assert!(resolve_scope(&server(false), Some(&directory(false))).is_none());
        assert!(resolve_scope(&server(false), None).is_none());
    }

    #[test]
    fn bindings_keep_declaration_order() {
        let mut s = ScopeConfig::default();
        s.add_binding("country/iso_code".parse().unwrap(), "A");
        s.add_binding("city/names/en".parse().unwrap(), "A");
        let names: Vec<_> = s.bindings.iter().map(|b| b.path.to_string()).collect();
        assert_eq!(names, ["country/iso_code", "city/names/en"]);
    }

    #[test]
    fn merge_takes_child_whole() {
        let mut parent = directory(true);
        parent.scope.add_binding("country/iso_code".parse().unwrap(), "PARENT");
        let child = DirectoryConfig::default();
        let merged = DirectoryConfig::merge(&parent, &child);
        assert_eq!(merged, child);
        assert!(merged.scope.bindings.is_empty());
    }

    #[test]
    fn location_prefix_respects_segments() {
        assert!(location_matches("/private", "/private"));
        assert!(location_matches("/private", "/private/x"));
        assert!(location_matches("/private/", "/private/x"));
        assert!(location_matches("/", "/anything"));
        assert!(!location_matches("/private", "/privateer"));
        assert!(!location_matches("/private", "/"));
    }

    #[test]
    fn most_specific_section_wins() {
        let config = ModuleConfig {
            main: ServerContext {
                server: server(true),
                sections: vec![
                    Section {
                        kind: SectionKind::Location,
                        pattern: "/geo".into(),
                        config: directory(true),
                    },
                    Section {
                        kind: SectionKind::Location,
                        pattern: "/geo/off".into(),
                        config: DirectoryConfig::default(),
                    },
                ],
            },
            virtual_hosts: Vec::new(),
        };

        let dir = config.directory_for(None, "/geo/x", None).unwrap();
        assert!(dir.scope.enabled);

        let scopes = config.scopes_for(None, "/geo/off/x", None);
        assert!(!scopes.directory.as_ref().unwrap().scope.enabled);
        // disabled section still falls back to the server scope
        assert_eq!(
            scopes.resolve().unwrap().database.as_deref(),
            Some(Utf8Path::new("/srv/server.mmdb"))
        );

        assert!(config.directory_for(None, "/other", None).is_none());
    }

    #[test]
    fn directory_sections_match_filenames() {
        let config = ModuleConfig {
            main: ServerContext {
                server: server(false),
                sections: vec![
                    Section {
                        kind: SectionKind::Directory,
                        pattern: "/var/www/geo".into(),
                        config: directory(true),
                    },
                    Section {
                        kind: SectionKind::Directory,
                        pattern: "/var/www".into(),
                        config: DirectoryConfig::default(),
                    },
                ],
            },
            virtual_hosts: Vec::new(),
        };
        let file = Utf8Path::new("/var/www/geo/index.html");
        assert!(config.directory_for(None, "/", Some(file)).unwrap().scope.enabled);
        let other = Utf8Path::new("/var/www/index.html");
        assert!(!config.directory_for(None, "/", Some(other)).unwrap().scope.enabled);
        assert!(config.directory_for(None, "/", None).is_none());
    }

    #[test]
    fn virtual_hosts_do_not_inherit_main_server() {
        let config = ModuleConfig {
            main: ServerContext {
                server: server(true),
                sections: Vec::new(),
            },
            virtual_hosts: vec![
                VirtualHost {
                    names: vec!["plain.example".into()],
                    context: ServerContext::default(),
                },
                VirtualHost {
                    names: vec!["geo.example".into()],
                    context: ServerContext {
                        server: ServerConfig {
                            scope: scope(true, "/srv/vhost.mmdb"),
                        },
                        sections: Vec::new(),
                    },
                },
            ],
        };
        assert!(!config.server_for(Some("plain.example:8080")).scope.enabled);
        assert_eq!(
            config.server_for(Some("GEO.example")).scope.database.as_deref(),
            Some(Utf8Path::new("/srv/vhost.mmdb"))
        );
        assert!(config.server_for(Some("other.example")).scope.enabled);
        assert!(config.server_for(None).scope.enabled);
    }

    #[test]
    fn database_paths_are_deduplicated() {
        let config = ModuleConfig {
            main: ServerContext {
                server: server(true),
                sections: vec![Section {
                    kind: SectionKind::Location,
                    pattern: "/".into(),
                    config: DirectoryConfig {
                        scope: scope(true, "/srv/server.mmdb"),
                    },
                }],
            },
            virtual_hosts: Vec::new(),
        };
        assert_eq!(config.database_paths(), [Utf8Path::new("/srv/server.mmdb")]);
    }

    #[test]
    fn ports_are_stripped_from_hosts() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("::1"), "::1");
    }
}
