//! Loading [`ModuleConfig`] from an Apache-style directive file.
//!
//! ```text
//! MaxMindDBEnable On
//! MaxMindDBFile /usr/share/GeoIP/GeoLite2-City.mmdb
//! MaxMindDBEnv country/iso_code COUNTRY
//!
//! <VirtualHost shop.example.com>
//!     ServerAlias www.shop.example.com
//!     <Location /checkout>
//!         MaxMindDBEnable On
//!         MaxMindDBFile /usr/share/GeoIP/GeoIP2-City.mmdb
//!         MaxMindDBEnv subdivisions/0/iso_code REGION STATE
//!         MaxMindDBEnv postal/code POSTCODE
//!     </Location>
//! </VirtualHost>
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, warn};

use crate::config::{
    strip_port, DirectoryConfig, ModuleConfig, ScopeConfig, Section, SectionKind, ServerContext,
    VirtualHost,
};
use crate::error::{Error, Result};
use crate::record::FieldPath;

pub const ENABLE: &str = "MaxMindDBEnable";
pub const DATABASE_FILE: &str = "MaxMindDBFile";
pub const ENV: &str = "MaxMindDBEnv";

/// Read and parse a directive file.
pub fn load(path: &Utf8Path) -> Result<ModuleConfig> {
    let text = std::fs::read_to_string(path)?;
    parse(path.as_str(), &text)
}

/// Parse directive text. `origin` names the source in error messages.
pub fn parse(origin: &str, text: &str) -> Result<ModuleConfig> {
    let mut parser = Parser {
        origin,
        config: ModuleConfig::default(),
        main_declared_at: 0,
        vhost: None,
        section: None,
    };

    for (line_no, line) in logical_lines(text) {
        parser.line(line_no, &line)?;
    }
    parser.finish()
}

/// Join `\`-continued lines and drop comments and blanks, keeping the line
/// number each logical line started on.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut pending = String::new();
    let mut start = 0;
    for (idx, raw) in text.lines().enumerate() {
        if pending.is_empty() {
            start = idx + 1;
        }
        let trimmed = raw.trim();
        if let Some(body) = trimmed.strip_suffix('\\') {
            pending.push_str(body);
            pending.push(' ');
            continue;
        }
        pending.push_str(trimmed);
        let line = std::mem::take(&mut pending);
        let line = line.trim();
        if !line.is_empty() && !line.starts_with('#') {
            out.push((start, line.to_string()));
        }
    }
    let line = pending.trim();
    if !line.is_empty() && !line.starts_with('#') {
        out.push((start, line.to_string()));
    }
    out
}

/// Split a line into arguments. Double-quoted arguments may contain spaces
/// and `\"`.
fn tokenize(line: &str) -> std::result::Result<Vec<String>, &'static str> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut arg = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' if chars.peek() == Some(&'"') => {
                        arg.push('"');
                        chars.next();
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => arg.push(c),
                }
            }
            if !closed {
                return Err("unterminated quoted argument");
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                arg.push(c);
                chars.next();
            }
        }
        args.push(arg);
    }
    Ok(args)
}

fn parse_flag(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("on") {
        Some(true)
    } else if value.eq_ignore_ascii_case("off") {
        Some(false)
    } else {
        None
    }
}

struct OpenVirtualHost {
    line: usize,
    names: Vec<String>,
    context: ServerContext,
    declared_at: usize,
}

struct OpenSection {
    line: usize,
    kind: SectionKind,
    pattern: String,
    config: DirectoryConfig,
}

struct Parser<'a> {
    origin: &'a str,
    config: ModuleConfig,
    main_declared_at: usize,
    vhost: Option<OpenVirtualHost>,
    section: Option<OpenSection>,
}

impl Parser<'_> {
    fn err(&self, line: usize, reason: impl Into<String>) -> Error {
        Error::config(self.origin, line, reason)
    }

    fn line(&mut self, line_no: usize, line: &str) -> Result<()> {
        if let Some(tag) = line.strip_prefix("</") {
            let name = tag
                .strip_suffix('>')
                .ok_or_else(|| self.err(line_no, "closing tag is missing '>'"))?;
            return self.close(line_no, name.trim());
        }
        if let Some(tag) = line.strip_prefix('<') {
            let inner = tag
                .strip_suffix('>')
                .ok_or_else(|| self.err(line_no, "section tag is missing '>'"))?;
            let args = tokenize(inner).map_err(|reason| self.err(line_no, reason))?;
            return self.open(line_no, args);
        }

        let args = tokenize(line).map_err(|reason| self.err(line_no, reason))?;
        let Some((name, args)) = args.split_first() else {
            return Ok(());
        };
        self.directive(line_no, name, args)
    }

    fn open(&mut self, line_no: usize, args: Vec<String>) -> Result<()> {
        let Some((name, args)) = args.split_first() else {
            return Err(self.err(line_no, "empty section tag"));
        };
        if self.section.is_some() {
            return Err(self.err(line_no, format!("<{name}> cannot be nested in another section")));
        }

        if name.eq_ignore_ascii_case("VirtualHost") {
            if self.vhost.is_some() {
                return Err(self.err(line_no, "<VirtualHost> cannot be nested"));
            }
            if args.is_empty() {
                return Err(self.err(line_no, "<VirtualHost> needs at least one address"));
            }
            self.vhost = Some(OpenVirtualHost {
                line: line_no,
                names: args.iter().map(|a| strip_port(a).to_string()).collect(),
                context: ServerContext::default(),
                declared_at: 0,
            });
            return Ok(());
        }

        let kind = if name.eq_ignore_ascii_case("Directory") {
            SectionKind::Directory
        } else if name.eq_ignore_ascii_case("Location") {
            SectionKind::Location
        } else {
            return Err(self.err(line_no, format!("unknown section <{name}>")));
        };
        let [pattern] = args else {
            return Err(self.err(line_no, format!("<{name}> takes exactly one argument")));
        };
        self.section = Some(OpenSection {
            line: line_no,
            kind,
            pattern: pattern.clone(),
            config: DirectoryConfig::default(),
        });
        Ok(())
    }

    fn close(&mut self, line_no: usize, name: &str) -> Result<()> {
        if let Some(section) = self.section.take() {
            let expected = match section.kind {
                SectionKind::Directory => "Directory",
                SectionKind::Location => "Location",
            };
            if !name.eq_ignore_ascii_case(expected) {
                return Err(self.err(line_no, format!("</{name}> closes <{expected}>")));
            }
            self.validate(&section.config.scope, section.line)?;
            let done = Section {
                kind: section.kind,
                pattern: section.pattern,
                config: section.config,
            };
            match self.vhost.as_mut() {
                Some(vhost) => vhost.context.sections.push(done),
                None => self.config.main.sections.push(done),
            }
            return Ok(());
        }

        if let Some(vhost) = self.vhost.take() {
            if !name.eq_ignore_ascii_case("VirtualHost") {
                return Err(self.err(line_no, format!("</{name}> closes <VirtualHost>")));
            }
            self.validate(&vhost.context.server.scope, vhost.declared_at)?;
            self.config.virtual_hosts.push(VirtualHost {
                names: vhost.names,
                context: vhost.context,
            });
            return Ok(());
        }

        Err(self.err(line_no, format!("</{name}> without matching section")))
    }

    fn validate(&self, scope: &ScopeConfig, line: usize) -> Result<()> {
        if scope.enabled && scope.database.is_none() {
            return Err(self.err(line, format!("{ENABLE} On without {DATABASE_FILE}")));
        }
        Ok(())
    }

    fn scope_label(&self) -> &'static str {
        match (&self.section, &self.vhost) {
            (Some(_), _) => "dir",
            (None, Some(_)) => "vhost",
            (None, None) => "server",
        }
    }

    /// The scope a GeoIP directive on this line applies to.
    fn target(&mut self, line_no: usize) -> &mut ScopeConfig {
        if let Some(section) = self.section.as_mut() {
            return &mut section.config.scope;
        }
        if let Some(vhost) = self.vhost.as_mut() {
            if vhost.declared_at == 0 {
                vhost.declared_at = line_no;
            }
            return &mut vhost.context.server.scope;
        }
        if self.main_declared_at == 0 {
            self.main_declared_at = line_no;
        }
        &mut self.config.main.server.scope
    }

    fn directive(&mut self, line_no: usize, name: &str, args: &[String]) -> Result<()> {
        let label = self.scope_label();

        if name.eq_ignore_ascii_case(ENABLE) {
            let [value] = args else {
                return Err(self.err(line_no, format!("{ENABLE} takes one argument")));
            };
            let enabled = parse_flag(value)
                .ok_or_else(|| self.err(line_no, format!("{ENABLE} must be On or Off")))?;
            debug!("{ENABLE} ({label}) {enabled}");
            self.target(line_no).enabled = enabled;
        } else if name.eq_ignore_ascii_case(DATABASE_FILE) {
            let (file, flags) = match args {
                [file] => (file, None),
                [file, flags] => (file, Some(flags)),
                _ => {
                    return Err(self.err(line_no, format!("{DATABASE_FILE} takes one or two arguments")))
                }
            };
            if let Some(flags) = flags {
                warn!("{}:{line_no}: {DATABASE_FILE} flags {flags:?} are ignored", self.origin);
            }
            debug!("{DATABASE_FILE} ({label}) {file}");
            self.target(line_no).database = Some(Utf8PathBuf::from(file));
        } else if name.eq_ignore_ascii_case(ENV) {
            // one field path, then every variable bound to it
            let [raw_path, variables @ ..] = args else {
                return Err(self.err(line_no, format!("{ENV} takes a field path and variables")));
            };
            if variables.is_empty() {
                return Err(self.err(line_no, format!("{ENV} {raw_path} names no variable")));
            }
            let path: FieldPath = raw_path
                .parse()
                .map_err(|e| self.err(line_no, format!("{ENV} {raw_path:?}: {e}")))?;
            for variable in variables {
                debug!("{ENV} ({label}) {path} {variable}");
                self.target(line_no).add_binding(path.clone(), variable.clone());
            }
        } else if name.eq_ignore_ascii_case("ServerName") || name.eq_ignore_ascii_case("ServerAlias") {
            if args.is_empty() {
                return Err(self.err(line_no, format!("{name} needs an argument")));
            }
            if self.section.is_some() {
                return Err(self.err(line_no, format!("{name} is not allowed in a section")));
            }
            if let Some(vhost) = self.vhost.as_mut() {
                vhost.names.extend(args.iter().map(|a| strip_port(a).to_string()));
            }
        } else {
            return Err(self.err(line_no, format!("unknown directive {name}")));
        }
        Ok(())
    }

    fn finish(self) -> Result<ModuleConfig> {
        if let Some(section) = &self.section {
            return Err(self.err(section.line, "section is never closed"));
        }
        if let Some(vhost) = &self.vhost {
            return Err(self.err(vhost.line, "<VirtualHost> is never closed"));
        }
        self.validate(&self.config.main.server.scope, self.main_declared_at)?;
        Ok(self.config)
    }
}
