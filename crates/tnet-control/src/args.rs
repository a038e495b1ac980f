use serde::Deserialize;
use tnet_process::ServiceKind;

use crate::error::{ControlError, ControlResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    #[default]
    Listen,
    Connect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    #[default]
    Proxy,
    Execute,
}

/// Structured create-form input. Fields that do not apply to a kind must be
/// left unset; see [`ServiceConfiguration::validate`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormConfig {
    #[serde(default)]
    pub tunnel_mode: TunnelMode,
    pub tunnel_listen: Option<String>,
    pub tunnel_connect: Option<String>,
    pub crypt_key: Option<String>,

    // proxy only
    pub mode: Option<ProxyMode>,
    pub listen: Option<String>,
    pub connect: Option<String>,
    pub execute: Option<String>,
    #[serde(default)]
    pub raw_pty: bool,
    pub dump_dir: Option<String>,

    // agent only
    #[serde(default)]
    pub enabled_execute: bool,
}

/// Create request payload, discriminated by `inputMode`.
///
/// Lives only for the duration of a create call; instances keep the compiled
/// argument list, never this structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "inputMode", rename_all = "lowercase")]
pub enum ServiceConfiguration {
    Form(FormConfig),
    Direct {
        #[serde(rename = "rawCommand")]
        raw_command: String,
    },
}

impl ServiceConfiguration {
    /// Boundary check: reject fields that belong to the other kind.
    pub fn validate(&self, kind: ServiceKind) -> ControlResult<()> {
        let ServiceConfiguration::Form(form) = self else {
            return Ok(());
        };

        let mut misplaced = Vec::new();
        match kind {
            ServiceKind::Agent => {
                for (name, set) in [
                    ("mode", form.mode.is_some()),
                    ("listen", form.listen.is_some()),
                    ("connect", form.connect.is_some()),
                    ("execute", form.execute.is_some()),
                    ("rawPty", form.raw_pty),
                    ("dumpDir", form.dump_dir.is_some()),
                ] {
                    if set {
                        misplaced.push(name);
                    }
                }
            }
            ServiceKind::Proxy => {
                if form.enabled_execute {
                    misplaced.push("enabledExecute");
                }
            }
        }

        if misplaced.is_empty() {
            Ok(())
        } else {
            Err(ControlError::Validation(format!(
                "fields not supported for {kind}: {}",
                misplaced.join(", ")
            )))
        }
    }
}

/// Compiles a configuration into the ordered argument list for `kind`.
///
/// Only direct mode can fail (unterminated quote). Form mode silently omits
/// unset optional fields.
pub fn build(kind: ServiceKind, config: &ServiceConfiguration) -> ControlResult<Vec<String>> {
    match config {
        ServiceConfiguration::Form(form) => Ok(build_form(kind, form)),
        ServiceConfiguration::Direct { raw_command } => parse_direct_command(raw_command),
    }
}

// Blank fields are skipped; anything else is passed through verbatim.
fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.trim().is_empty())
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: &Option<String>) {
    if let Some(v) = non_empty(value) {
        args.push(format!("{flag}={v}"));
    }
}

// Order matters: instances are re-invoked as literal commands.
fn build_form(kind: ServiceKind, form: &FormConfig) -> Vec<String> {
    let mut args = Vec::new();

    match form.tunnel_mode {
        TunnelMode::Listen => push_flag(&mut args, "--tunnel-listen", &form.tunnel_listen),
        TunnelMode::Connect => push_flag(&mut args, "--tunnel-connect", &form.tunnel_connect),
    }

    if kind == ServiceKind::Proxy {
        match form.mode.unwrap_or_default() {
            ProxyMode::Proxy => {
                push_flag(&mut args, "--listen", &form.listen);
                push_flag(&mut args, "--connect", &form.connect);
            }
            ProxyMode::Execute => {
                push_flag(&mut args, "--execute", &form.execute);
                if form.raw_pty {
                    args.push("--raw-pty".to_string());
                }
            }
        }
    }

    push_flag(&mut args, "--crypt-key", &form.crypt_key);

    match kind {
        ServiceKind::Agent => {
            if form.enabled_execute {
                args.push("--enabled-execute".to_string());
            }
        }
        ServiceKind::Proxy => push_flag(&mut args, "--dump-dir", &form.dump_dir),
    }

    args
}

/// Splits a raw command line into tokens.
///
/// A backslash escapes the next character, a double quote toggles quoting,
/// and an unquoted space ends the current token. Empty tokens are dropped.
pub fn tokenize(line: &str) -> ControlResult<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in line.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            in_quotes = !in_quotes;
        } else if c == ' ' && !in_quotes {
            if !current.is_empty() {
                args.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }

    if in_quotes {
        return Err(ControlError::Validation(
            "unterminated quote in command line".to_string(),
        ));
    }
    // A dangling backslash has nothing to escape and is dropped.
    if !current.is_empty() {
        args.push(current);
    }
    Ok(args)
}

/// Tokenizes a direct-mode command and drops a leading `agent`/`proxy` token;
/// the kind comes from the endpoint, not from the text.
pub fn parse_direct_command(line: &str) -> ControlResult<Vec<String>> {
    let mut args = tokenize(line)?;
    strip_kind_token(&mut args);
    Ok(args)
}

pub(crate) fn strip_kind_token(args: &mut Vec<String>) {
    if args
        .first()
        .is_some_and(|first| ServiceKind::from_command_token(first).is_some())
    {
        args.remove(0);
    }
}

fn quote_token(token: &str) -> String {
    let needs_quotes =
        token.is_empty() || token.chars().any(|c| matches!(c, ' ' | '"' | '\\'));
    if !needs_quotes {
        return token.to_string();
    }
    let mut out = String::with_capacity(token.len() + 2);
    out.push('"');
    for c in token.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Full `tnet <kind> ...` command line. Contains secrets: only for the
/// explicit reveal action.
pub fn command_line(kind: ServiceKind, args: &[String]) -> String {
    let mut parts = vec!["tnet".to_string(), kind.as_str().to_string()];
    parts.extend(args.iter().map(|a| quote_token(a)));
    parts.join(" ")
}
