//! Safety Gate (spec §4.A). Pure function over command strings; never
//! touches the network. Classification is evaluated against the whole
//! command against ordered regex rule sets, after whitespace normalization,
//! which also makes classification idempotent under that normalization.

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::model::canonicalize_command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum SafetyMode {
    #[default]
    Standard,
    AllowlistOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Allowed,
    Warn { reasons: Vec<String> },
    Blocked { reason: String },
}

impl Classification {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Classification::Blocked { .. })
    }
}

struct Rule {
    pattern: Regex,
    reason: &'static str,
}

static BLOCKLIST: Lazy<Vec<Rule>> = Lazy::new(|| {
    [
        (r"rm\s+-[rRf]+\S*.*\s+/(\s|$)", "recursive deletion of the root filesystem"),
        (r"\bmkfs(\.\S+)?\b", "filesystem creation"),
        (r"\bdd\b.*\bof=/dev/\S+", "raw write to a block device"),
        (r":\(\)\s*\{\s*:\s*\|\s*:\s*&?\s*\}\s*;\s*:", "fork bomb"),
        (r"^\s*(sudo\s+)?(shutdown|reboot|halt|poweroff)\b", "system shutdown/reboot"),
        (r"\bwipefs\b", "disk wipe"),
        (r"\bshred\b.*-\S*u", "unrecoverable file shred"),
    ]
    .into_iter()
    .map(|(pattern, reason)| Rule { pattern: Regex::new(pattern).expect("valid blocklist regex"), reason })
    .collect()
});

static WARNLIST: Lazy<Vec<Rule>> = Lazy::new(|| {
    [
        (r"\bsudo\b", "elevated privileges via sudo"),
        (r"\bchmod\s+777\b", "world-writable permission change"),
        (r"\bkill\s+-9\b", "unconditional process kill"),
        (
            r"\b(apt(-get)?|yum|dnf|pacman|pip3?|npm)\s+(install|remove|uninstall|update|upgrade)\b",
            "package management operation",
        ),
    ]
    .into_iter()
    .map(|(pattern, reason)| Rule { pattern: Regex::new(pattern).expect("valid warnlist regex"), reason })
    .collect()
});

static ALLOWLIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(ls|cat|grep|egrep|fgrep|head|tail|find|pwd|whoami|id|df|du|ps|uptime|uname|echo|awk|sed\s+-n|stat|file|which|wc|hostname)\b")
        .expect("valid allowlist regex")
});

/// Classifies a raw command string. `mode` selects between the default
/// block/warn policy and allowlist-only mode, where anything not matching
/// the read-only allowlist is blocked outright.
pub fn classify(command: &str, mode: SafetyMode) -> Classification {
    let normalized = canonicalize_command(command);

    for rule in BLOCKLIST.iter() {
        if rule.pattern.is_match(&normalized) {
            return Classification::Blocked { reason: rule.reason.to_string() };
        }
    }

    if mode == SafetyMode::AllowlistOnly {
        let first_token = first_token(&normalized);
        if !ALLOWLIST.is_match(first_token) {
            return Classification::Blocked {
                reason: format!("'{first_token}' is not on the read-only allowlist"),
            };
        }
    }

    let reasons: Vec<String> = WARNLIST
        .iter()
        .filter(|rule| rule.pattern.is_match(&normalized))
        .map(|rule| rule.reason.to_string())
        .collect();

    if reasons.is_empty() {
        Classification::Allowed
    } else {
        Classification::Warn { reasons }
    }
}

/// Strips leading environment-variable assignments (`FOO=bar BAZ=qux cmd`)
/// and returns the command's first shell token, used by allowlist mode.
fn first_token(normalized: &str) -> &str {
    let mut rest = normalized;
    loop {
        let token_end = rest.find(' ').unwrap_or(rest.len());
        let token = &rest[..token_end];
        if token.contains('=') && token.chars().next().is_some_and(|c| c.is_alphabetic() || c == '_') {
            rest = rest[token_end..].trim_start();
            if rest.is_empty() {
                return rest;
            }
            continue;
        }
        return token;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocklist_fixture_is_blocked() {
        let fixture = [
            "rm -rf /",
            "rm -fr / ",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            ":(){ :|:& };:",
            "shutdown -h now",
            "reboot",
            "wipefs -a /dev/sda",
            "shred -u secret.txt",
        ];
        for cmd in fixture {
            assert!(classify(cmd, SafetyMode::Standard).is_blocked(), "expected block: {cmd}");
        }
    }

    #[test]
    fn warnlist_fixture_is_warn() {
        let fixture = ["sudo apt-get update", "chmod 777 /tmp/x", "kill -9 1234", "pip install foo"];
        for cmd in fixture {
            let result = classify(cmd, SafetyMode::Standard);
            assert!(matches!(result, Classification::Warn { .. }), "expected warn: {cmd}");
        }
    }

    #[test]
    fn benign_commands_are_allowed() {
        assert_eq!(classify("ls -la /tmp", SafetyMode::Standard), Classification::Allowed);
        assert_eq!(classify("echo hello", SafetyMode::Standard), Classification::Allowed);
    }

    #[test]
    fn idempotent_under_whitespace_normalization() {
        let a = classify("rm   -rf    /", SafetyMode::Standard);
        let b = classify("rm -rf /", SafetyMode::Standard);
        assert_eq!(a, b);
    }

    #[test]
    fn allowlist_mode_blocks_anything_not_read_only() {
        assert_eq!(classify("ls -la", SafetyMode::AllowlistOnly), Classification::Allowed);
        assert!(classify("touch /tmp/x", SafetyMode::AllowlistOnly).is_blocked());
    }

    #[test]
    fn allowlist_mode_skips_leading_env_assignments() {
        let result = classify("FOO=bar BAZ=qux ls -la", SafetyMode::AllowlistOnly);
        assert_eq!(result, Classification::Allowed);
    }

    #[test]
    fn blocklist_takes_priority_over_warnlist() {
        let result = classify("sudo rm -rf /", SafetyMode::Standard);
        assert!(result.is_blocked());
    }
}
