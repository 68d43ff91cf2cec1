use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::error::ConfigError;
use crate::config::server::{
    AllowedMethods, Config, Location, Policy, Redirect, ServerBlock, Settings, DEFAULT_PORT,
};
use crate::http::request::Method;
use crate::http::status;

/// Configuration used when no file is given on the command line
pub const DEFAULT_CONFIG: &str = "server {
    listen 8080;
    server_name webserv;

    index index.html index.php;

    location /ping {
        allowed_methods GET;
    }

    location /google {
        redirect 301 http://google.fr/;
    }
}
";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Open,
    Close,
    Semi,
}

#[derive(Debug, Clone)]
struct Lexed {
    token: Token,
    line: usize,
}

/// A directive with its arguments, not yet interpreted
#[derive(Debug, Clone)]
struct Directive {
    name: String,
    args: Vec<String>,
    line: usize,
}

impl Directive {
    fn expect_args(&self, min: usize, max: usize) -> Result<(), ConfigError> {
        let n = self.args.len();
        if n < min || n > max {
            let expected = if min == max {
                format!("{}", min)
            } else if max == usize::MAX {
                format!("at least {}", min)
            } else {
                format!("{} to {}", min, max)
            };
            return Err(ConfigError::invalid(
                self.line,
                &self.name,
                format!("expected {} argument(s), got {}", expected, n),
            ));
        }
        Ok(())
    }

    fn single(&self) -> Result<&str, ConfigError> {
        self.expect_args(1, 1)?;
        Ok(&self.args[0])
    }
}

/// Parser for the nginx-style configuration format
pub struct ConfigParser {
    tokens: Vec<Lexed>,
    pos: usize,
}

impl ConfigParser {
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_str(&content)
    }

    pub fn parse_str(content: &str) -> Result<Config, ConfigError> {
        let mut parser = ConfigParser {
            tokens: tokenize(content)?,
            pos: 0,
        };
        parser.parse()
    }

    fn parse(&mut self) -> Result<Config, ConfigError> {
        let mut config = Config::default();

        while let Some(lexed) = self.next() {
            match lexed.token {
                Token::Word(word) if word == "server" => {
                    self.expect(Token::Open, "`{` after `server`")?;
                    config.servers.push(self.parse_server(lexed.line)?);
                }
                Token::Word(word) => {
                    let directive = self.read_directive(word, lexed.line)?;
                    apply_setting(&mut config.settings, &directive)?;
                }
                other => {
                    return Err(ConfigError::syntax(
                        lexed.line,
                        format!("unexpected {}", describe(&other)),
                    ))
                }
            }
        }

        Ok(config)
    }

    fn parse_server(&mut self, opened_at: usize) -> Result<ServerBlock, ConfigError> {
        let mut server = ServerBlock::default();
        let mut pending_locations: Vec<(String, usize, Vec<Directive>)> = Vec::new();

        loop {
            let Some(lexed) = self.next() else {
                return Err(ConfigError::syntax(opened_at, "unclosed `server` block"));
            };
            match lexed.token {
                Token::Close => break,
                Token::Word(word) if word == "location" => {
                    let prefix = match self.next() {
                        Some(Lexed { token: Token::Word(p), .. }) => p,
                        _ => return Err(ConfigError::syntax(lexed.line, "`location` needs a path")),
                    };
                    self.expect(Token::Open, "`{` after location path")?;
                    let directives = self.read_block(lexed.line)?;
                    pending_locations.push((prefix, lexed.line, directives));
                }
                Token::Word(word) => {
                    let directive = self.read_directive(word, lexed.line)?;
                    apply_server(&mut server, &directive)?;
                }
                other => {
                    return Err(ConfigError::syntax(
                        lexed.line,
                        format!("unexpected {} in server block", describe(&other)),
                    ))
                }
            }
        }

        // Locations start from the finished server policy, whatever the
        // directive order inside the block was
        for (prefix, line, directives) in pending_locations {
            let prefix = normalize_prefix(&prefix)
                .ok_or_else(|| ConfigError::invalid(line, "location", "path must start with `/`"))?;
            if server.locations.iter().any(|l| l.prefix == prefix) {
                return Err(ConfigError::invalid(line, "location", format!("duplicate location `{}`", prefix)));
            }
            let mut policy = server.policy.clone();
            for directive in &directives {
                apply_policy(&mut policy, directive)?;
            }
            server.locations.push(Location { prefix, policy });
        }

        Ok(server)
    }

    /// Directives up to the closing brace of a location block
    fn read_block(&mut self, opened_at: usize) -> Result<Vec<Directive>, ConfigError> {
        let mut directives = Vec::new();
        loop {
            let Some(lexed) = self.next() else {
                return Err(ConfigError::syntax(opened_at, "unclosed `location` block"));
            };
            match lexed.token {
                Token::Close => return Ok(directives),
                Token::Word(word) => directives.push(self.read_directive(word, lexed.line)?),
                other => {
                    return Err(ConfigError::syntax(
                        lexed.line,
                        format!("unexpected {} in location block", describe(&other)),
                    ))
                }
            }
        }
    }

    fn read_directive(&mut self, name: String, line: usize) -> Result<Directive, ConfigError> {
        let mut args = Vec::new();
        loop {
            match self.next() {
                Some(Lexed { token: Token::Word(arg), .. }) => args.push(arg),
                Some(Lexed { token: Token::Semi, .. }) => return Ok(Directive { name, args, line }),
                Some(Lexed { token, line }) => {
                    return Err(ConfigError::syntax(
                        line,
                        format!("expected `;` after `{}`, found {}", name, describe(&token)),
                    ))
                }
                None => {
                    return Err(ConfigError::syntax(line, format!("missing `;` after `{}`", name)))
                }
            }
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), ConfigError> {
        match self.next() {
            Some(lexed) if lexed.token == token => Ok(()),
            Some(lexed) => Err(ConfigError::syntax(lexed.line, format!("expected {}", what))),
            None => Err(ConfigError::syntax(self.last_line(), format!("expected {}", what))),
        }
    }

    fn next(&mut self) -> Option<Lexed> {
        let lexed = self.tokens.get(self.pos).cloned();
        if lexed.is_some() {
            self.pos += 1;
        }
        lexed
    }

    fn last_line(&self) -> usize {
        self.tokens.last().map(|l| l.line).unwrap_or(1)
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Word(w) => format!("`{}`", w),
        Token::Open => "`{`".to_string(),
        Token::Close => "`}`".to_string(),
        Token::Semi => "`;`".to_string(),
    }
}

fn tokenize(content: &str) -> Result<Vec<Lexed>, ConfigError> {
    let mut tokens = Vec::new();
    let mut chars = content.chars().peekable();
    let mut line = 1;

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            c if c.is_whitespace() => {}
            '#' => {
                // Comment runs to end of line
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '{' => tokens.push(Lexed { token: Token::Open, line }),
            '}' => tokens.push(Lexed { token: Token::Close, line }),
            ';' => tokens.push(Lexed { token: Token::Semi, line }),
            '"' | '\'' => {
                let start = line;
                let mut word = String::new();
                loop {
                    match chars.next() {
                        Some(q) if q == c => break,
                        Some('\n') => {
                            line += 1;
                            word.push('\n');
                        }
                        Some(other) => word.push(other),
                        None => return Err(ConfigError::syntax(start, "unterminated quoted string")),
                    }
                }
                tokens.push(Lexed { token: Token::Word(word), line: start });
            }
            c => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || matches!(next, '{' | '}' | ';' | '#') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                tokens.push(Lexed { token: Token::Word(word), line });
            }
        }
    }

    Ok(tokens)
}

fn apply_setting(settings: &mut Settings, d: &Directive) -> Result<(), ConfigError> {
    match d.name.as_str() {
        "client_timeout" => settings.client_timeout = parse_duration(d)?,
        "cgi_timeout" => settings.cgi_timeout = parse_duration(d)?,
        "cgi_max_output" => settings.cgi_max_output = parse_size(d)?,
        "max_uri_length" => settings.max_uri_length = parse_size(d)?,
        "max_header_size" => settings.max_header_size = parse_size(d)?,
        "max_body_size" => settings.max_body_size = parse_size(d)?,
        "sessions" => settings.sessions = parse_switch(d)?,
        "session_timeout" => settings.session_timeout = parse_duration(d)?,
        _ => {
            return Err(ConfigError::UnknownDirective {
                line: d.line,
                name: d.name.clone(),
            })
        }
    }
    Ok(())
}

fn apply_server(server: &mut ServerBlock, d: &Directive) -> Result<(), ConfigError> {
    match d.name.as_str() {
        "listen" => server.listen = parse_listen(d)?,
        "server_name" => {
            d.expect_args(1, usize::MAX)?;
            server.names = d.args.iter().map(|n| n.to_ascii_lowercase()).collect();
        }
        _ => apply_policy(&mut server.policy, d)?,
    }
    Ok(())
}

fn apply_policy(policy: &mut Policy, d: &Directive) -> Result<(), ConfigError> {
    match d.name.as_str() {
        "root" => policy.root = PathBuf::from(d.single()?),
        "index" => {
            d.expect_args(1, usize::MAX)?;
            policy.index = d.args.clone();
        }
        "autoindex" => policy.autoindex = parse_switch(d)?,
        "allowed_methods" | "limit_except" => {
            d.expect_args(1, usize::MAX)?;
            let mut methods = AllowedMethods::none();
            for arg in &d.args {
                match Method::from_token(&arg.to_ascii_uppercase()) {
                    Some(m) if m.is_implemented() => methods.allow(m),
                    _ => return Err(ConfigError::invalid(d.line, &d.name, format!("unsupported method `{}`", arg))),
                }
            }
            policy.methods = methods;
        }
        "body_limit" | "client_max_body_size" => policy.body_limit = parse_size(d)?,
        "upload_pass" | "upload_path" => policy.upload_path = Some(PathBuf::from(d.single()?)),
        "redirect" | "return" => {
            d.expect_args(2, 2)?;
            let code = parse_code(d, &d.args[0])?;
            if !status::is_redirect(code) {
                return Err(ConfigError::invalid(d.line, &d.name, format!("{} is not a 3xx code", code)));
            }
            policy.redirect = Some(Redirect {
                code,
                target: d.args[1].clone(),
            });
        }
        "error_page" => {
            d.expect_args(2, usize::MAX)?;
            let (path, codes) = d.args.split_last().ok_or_else(|| ConfigError::invalid(d.line, &d.name, "missing path"))?;
            for raw in codes {
                let code = parse_code(d, raw)?;
                if !status::is_error(code) {
                    return Err(ConfigError::invalid(d.line, &d.name, format!("{} is not a 4xx/5xx code", code)));
                }
                policy.error_pages.insert(code, PathBuf::from(path));
            }
        }
        "cgi" | "cgi_path" => {
            d.expect_args(2, 2)?;
            let ext = d.args[0].trim_start_matches('.');
            if ext.is_empty() {
                return Err(ConfigError::invalid(d.line, &d.name, "empty extension"));
            }
            policy.cgi.insert(format!(".{}", ext), PathBuf::from(&d.args[1]));
        }
        "listen" | "server_name" => {
            return Err(ConfigError::invalid(d.line, &d.name, "only allowed in a server block"));
        }
        _ => {
            return Err(ConfigError::UnknownDirective {
                line: d.line,
                name: d.name.clone(),
            })
        }
    }
    Ok(())
}

/// `port`, `host:port` or `host`. A missing host or `*` binds every interface.
fn parse_listen(d: &Directive) -> Result<SocketAddr, ConfigError> {
    let raw = d.single()?;
    let bad = |msg: &str| ConfigError::invalid(d.line, &d.name, format!("{}: `{}`", msg, raw));

    let (host, port) = match raw.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| bad("invalid port"))?),
        None => match raw.parse::<u16>() {
            Ok(port) => ("", port),
            Err(_) => (raw, DEFAULT_PORT),
        },
    };

    let ip = match host.trim_start_matches('[').trim_end_matches(']') {
        "" | "*" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
        other => other.parse::<IpAddr>().map_err(|_| bad("invalid address"))?,
    };

    Ok(SocketAddr::new(ip, port))
}

fn normalize_prefix(prefix: &str) -> Option<String> {
    if !prefix.starts_with('/') {
        return None;
    }
    let trimmed = prefix.trim_end_matches('/');
    Some(if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() })
}

fn parse_code(d: &Directive, raw: &str) -> Result<u16, ConfigError> {
    raw.parse::<u16>()
        .ok()
        .filter(|c| (100..600).contains(c))
        .ok_or_else(|| ConfigError::invalid(d.line, &d.name, format!("invalid status code `{}`", raw)))
}

fn parse_switch(d: &Directive) -> Result<bool, ConfigError> {
    match d.single()?.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" => Ok(true),
        "off" | "false" | "no" => Ok(false),
        other => Err(ConfigError::invalid(d.line, &d.name, format!("expected on/off, got `{}`", other))),
    }
}

/// Parse duration from string (e.g., "30", "30s", "5m", "1h")
fn parse_duration(d: &Directive) -> Result<Duration, ConfigError> {
    let value = d.single()?;
    let (digits, unit) = match value.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((i, _)) => value.split_at(i),
        None => (value, ""),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| ConfigError::invalid(d.line, &d.name, format!("invalid duration `{}`", value)))?;
    let secs = match unit {
        "" | "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        _ => return Err(ConfigError::invalid(d.line, &d.name, format!("invalid duration unit `{}`", unit))),
    };
    Ok(Duration::from_secs(secs))
}

/// Parse size from string (e.g., "1000000", "512K", "10M", "1G")
fn parse_size(d: &Directive) -> Result<usize, ConfigError> {
    let value = d.single()?;
    let upper = value.to_ascii_uppercase();
    let trimmed = upper.strip_suffix('B').unwrap_or(&upper);
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('K') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('G') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    digits
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| ConfigError::invalid(d.line, &d.name, format!("invalid size `{}`", value)))
}
