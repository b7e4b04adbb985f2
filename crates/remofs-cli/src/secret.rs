//! Secret sources
//!
//! `text[:utf8|base64]:<value>`, `env[:utf8|base64]:<name>`, `file:<path>`
//! and `stdin[:utf8|base64]`.

use anyhow::{bail, Context, Result};
use base64::Engine;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Utf8,
    Base64,
}

impl Encoding {
    fn decode(self, value: &str) -> Result<Vec<u8>> {
        match self {
            Encoding::Utf8 => Ok(value.as_bytes().to_vec()),
            Encoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(value.trim())
                .context("secret is not valid base64"),
        }
    }
}

/// Split an optional `utf8:`/`base64:` segment off the front of `rest`
fn split_encoding(rest: &str) -> (Encoding, &str) {
    if let Some(value) = rest.strip_prefix("utf8:") {
        (Encoding::Utf8, value)
    } else if let Some(value) = rest.strip_prefix("base64:") {
        (Encoding::Base64, value)
    } else {
        (Encoding::Utf8, rest)
    }
}

pub fn parse_secret(arg: &str) -> Result<Vec<u8>> {
    parse_secret_with(arg, || {
        let mut input = String::new();
        std::io::stdin().read_to_string(&mut input)?;
        Ok(input)
    })
}

fn parse_secret_with<F>(arg: &str, read_stdin: F) -> Result<Vec<u8>>
where
    F: FnOnce() -> std::io::Result<String>,
{
    let (source, rest) = arg.split_once(':').unwrap_or((arg, ""));
    let secret = match source {
        "text" => {
            let (encoding, value) = split_encoding(rest);
            encoding.decode(value)?
        }
        "env" => {
            let (encoding, name) = split_encoding(rest);
            let value = std::env::var(name).with_context(|| format!("environment variable {name:?} is not set"))?;
            encoding.decode(&value)?
        }
        "file" => {
            if rest.is_empty() {
                bail!("file secret needs a path");
            }
            std::fs::read(rest).with_context(|| format!("reading secret file {rest:?}"))?
        }
        "stdin" => {
            let encoding = match rest {
                "" | "utf8" => Encoding::Utf8,
                "base64" => Encoding::Base64,
                other => bail!("unknown stdin encoding {other:?}"),
            };
            let input = read_stdin().context("reading secret from stdin")?;
            let line = input
                .strip_suffix("\r\n")
                .or_else(|| input.strip_suffix('\n'))
                .unwrap_or(&input);
            encoding.decode(line)?
        }
        other => bail!("unknown secret source {other:?} (expected text, env, file or stdin)"),
    };

    if secret.is_empty() {
        bail!("secret is empty");
    }
    Ok(secret)
}
