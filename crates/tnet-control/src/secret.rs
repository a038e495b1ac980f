//! Crypt-key redaction.
//!
//! Every argument list that is rendered or logged goes through [`mask`]; free
//! text that may echo arguments (error messages, console lines) goes through
//! [`mask_text`]. The unmasked list is only used to launch the process and for
//! the explicit reveal action.

use rand::Rng;

pub const CRYPT_KEY_PREFIX: &str = "--crypt-key=";
pub const MASKED_CRYPT_KEY: &str = "--crypt-key=**********";

pub fn mask(args: &[String]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            if arg.starts_with(CRYPT_KEY_PREFIX) {
                MASKED_CRYPT_KEY.to_string()
            } else {
                arg.clone()
            }
        })
        .collect()
}

/// Redacts every `--crypt-key=<value>` occurrence inside arbitrary text.
///
/// The value ends at whitespace or a quote character.
pub fn mask_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(CRYPT_KEY_PREFIX) {
        out.push_str(&rest[..pos]);
        out.push_str(MASKED_CRYPT_KEY);
        let after = &rest[pos + CRYPT_KEY_PREFIX.len()..];
        let end = after
            .find(|c: char| c.is_whitespace() || c == '"' || c == '\'')
            .unwrap_or(after.len());
        rest = &after[end..];
    }
    out.push_str(rest);
    out
}

/// Bare values shorter than this are only redacted behind the flag prefix.
const MIN_BARE_SECRET_LEN: usize = 4;

/// Literal crypt-key values carried by `args`, longest first.
pub fn crypt_key_values(args: &[String]) -> Vec<String> {
    let mut values: Vec<String> = args
        .iter()
        .filter_map(|a| a.strip_prefix(CRYPT_KEY_PREFIX))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    values.sort();
    values.dedup();
    values.sort_by_key(|v| std::cmp::Reverse(v.len()));
    values
}

/// Redacts the known key `values` verbatim, then applies [`mask_text`].
///
/// Keys may contain spaces or quotes (direct mode allows both), which the
/// prefix scan alone would cut short.
pub fn redact(text: &str, values: &[String]) -> String {
    let masked_value = &MASKED_CRYPT_KEY[CRYPT_KEY_PREFIX.len()..];
    let mut out = text.to_string();
    for value in values {
        out = out.replace(&format!("{CRYPT_KEY_PREFIX}{value}"), MASKED_CRYPT_KEY);
        if value.chars().count() >= MIN_BARE_SECRET_LEN {
            out = out.replace(value.as_str(), masked_value);
        }
    }
    mask_text(&out)
}

/// Suggested crypt key for the create form: a 13-digit number from the OS CSPRNG.
pub fn generate_crypt_key() -> String {
    rand::rngs::OsRng
        .gen_range(1_000_000_000_000u64..10_000_000_000_000u64)
        .to_string()
}
