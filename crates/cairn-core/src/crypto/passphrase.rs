//! Passphrase acquisition.
//!
//! Priority order: explicit new-passphrase variable (key-change flows
//! only), then the fixed passphrase variable, then the passphrase
//! command's stdout, then the passphrase file descriptor, then the
//! caller-supplied interactive prompt.

use std::io::Read;
use std::process::Command;

use zeroize::Zeroizing;

use cairn_types::error::{CairnError, Result};

use crate::config::RuntimeConfig;

/// A prompt callback; `None` means non-interactive operation.
pub type PromptFn<'a> = Option<&'a dyn Fn(&str) -> Result<String>>;

/// Resolve the passphrase for opening an existing repository.
pub fn for_open(config: &RuntimeConfig, prompt: PromptFn<'_>) -> Result<Option<Zeroizing<String>>> {
    resolve(config, prompt, false)
}

/// Resolve the passphrase for creating key material (init, key change).
/// Unlike [`for_open`], the new-passphrase variable takes priority here.
pub fn for_new(config: &RuntimeConfig, prompt: PromptFn<'_>) -> Result<Option<Zeroizing<String>>> {
    resolve(config, prompt, true)
}

fn resolve(
    config: &RuntimeConfig,
    prompt: PromptFn<'_>,
    want_new: bool,
) -> Result<Option<Zeroizing<String>>> {
    if want_new {
        if let Some(p) = &config.new_passphrase {
            return Ok(Some(Zeroizing::new(p.clone())));
        }
    }
    if let Some(p) = &config.passphrase {
        return Ok(Some(Zeroizing::new(p.clone())));
    }
    if let Some(cmd) = &config.passcommand {
        return Ok(Some(from_command(cmd)?));
    }
    if let Some(fd) = config.passphrase_fd {
        return Ok(Some(from_fd(fd)?));
    }
    if let Some(prompt) = prompt {
        return Ok(Some(Zeroizing::new(prompt("Enter passphrase: ")?)));
    }
    Ok(None)
}

/// Run the passphrase command through the shell; its stdout, with one
/// trailing newline stripped, is the passphrase.
fn from_command(cmd: &str) -> Result<Zeroizing<String>> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .map_err(|e| CairnError::Config(format!("passphrase command failed to run: {e}")))?;
    if !output.status.success() {
        return Err(CairnError::Config(format!(
            "passphrase command exited with {}",
            output.status
        )));
    }
    let mut text = String::from_utf8(output.stdout)
        .map_err(|_| CairnError::Config("passphrase command produced non-UTF-8 output".into()))?;
    if text.ends_with('\n') {
        text.pop();
        if text.ends_with('\r') {
            text.pop();
        }
    }
    Ok(Zeroizing::new(text))
}

/// Read the passphrase from an inherited file descriptor.
fn from_fd(fd: i32) -> Result<Zeroizing<String>> {
    let mut file = std::fs::File::open(format!("/dev/fd/{fd}"))
        .map_err(|e| CairnError::Config(format!("cannot open passphrase fd {fd}: {e}")))?;
    let mut text = String::new();
    file.read_to_string(&mut text)
        .map_err(|e| CairnError::Config(format!("cannot read passphrase fd {fd}: {e}")))?;
    while text.ends_with('\n') || text.ends_with('\r') {
        text.pop();
    }
    Ok(Zeroizing::new(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_passphrase_wins_over_command() {
        let config = RuntimeConfig {
            passphrase: Some("from-var".into()),
            passcommand: Some("echo from-command".into()),
            ..Default::default()
        };
        let p = for_open(&config, None).unwrap().unwrap();
        assert_eq!(p.as_str(), "from-var");
    }

    #[test]
    fn new_passphrase_only_applies_to_new_keys() {
        let config = RuntimeConfig {
            new_passphrase: Some("fresh".into()),
            passphrase: Some("old".into()),
            ..Default::default()
        };
        assert_eq!(for_open(&config, None).unwrap().unwrap().as_str(), "old");
        assert_eq!(for_new(&config, None).unwrap().unwrap().as_str(), "fresh");
    }

    #[test]
    fn command_output_is_stripped() {
        let config = RuntimeConfig {
            passcommand: Some("echo secret-word".into()),
            ..Default::default()
        };
        let p = for_open(&config, None).unwrap().unwrap();
        assert_eq!(p.as_str(), "secret-word");
    }

    #[test]
    fn failing_command_is_an_error() {
        let config = RuntimeConfig {
            passcommand: Some("false".into()),
            ..Default::default()
        };
        assert!(for_open(&config, None).is_err());
    }

    #[test]
    fn prompt_is_last_resort() {
        let config = RuntimeConfig::default();
        let prompt = |_: &str| Ok("typed".to_string());
        let p = for_open(&config, Some(&prompt)).unwrap().unwrap();
        assert_eq!(p.as_str(), "typed");
        assert!(for_open(&config, None).unwrap().is_none());
    }
}
