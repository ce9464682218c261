//! Per-team flags for dynamic container challenges.
//!
//! Templates may contain `[GUID]`, replaced by a random uuid, and
//! `[TEAM_HASH]`, replaced by a short hash of team, challenge and instance.
//! The hash lets an organizer trace a leaked flag back to the instance it was
//! issued to. A template without placeholders gets a team hash appended inside
//! its closing brace, so flags stay unique per team.

use sha2::{Digest, Sha256};
use uuid::Uuid;

const GUID: &str = "[GUID]";
const TEAM_HASH: &str = "[TEAM_HASH]";

pub fn team_hash(team: i64, challenge: i64, instance: Uuid) -> String {
    let digest = Sha256::digest(format!("{team}::{challenge}::{instance}"));
    hex::encode(&digest[..6])
}

pub fn team_flag(template: Option<&str>, team: i64, challenge: i64, instance: Uuid) -> String {
    let template = match template.map(str::trim) {
        None | Some("") => return format!("flag{{{}}}", Uuid::new_v4().simple()),
        Some(t) => t,
    };

    let template = if template.contains(GUID) || template.contains(TEAM_HASH) {
        template.to_string()
    } else if let Some(body) = template.strip_suffix('}') {
        format!("{body}_{TEAM_HASH}}}")
    } else {
        format!("{template}_{TEAM_HASH}")
    };

    template
        .replace(GUID, &Uuid::new_v4().simple().to_string())
        .replace(TEAM_HASH, &team_hash(team, challenge, instance))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flag_is_random() {
        let id = Uuid::new_v4();
        let a = team_flag(None, 1, 2, id);
        let b = team_flag(Some("  "), 1, 2, id);
        assert!(a.starts_with("flag{") && a.ends_with('}'));
        assert_eq!(a.len(), "flag{}".len() + 32);
        assert_ne!(a, b);
    }

    #[test]
    fn placeholders() {
        let id = Uuid::new_v4();
        let hash = team_hash(4, 9, id);
        assert_eq!(hash.len(), 12);

        let flag = team_flag(Some("ctf{[TEAM_HASH]_[GUID]}"), 4, 9, id);
        assert!(flag.starts_with(&format!("ctf{{{hash}_")));
        assert!(!flag.contains('['));
    }

    #[test]
    fn bare_template_gets_hash() {
        let id = Uuid::new_v4();
        let flag = team_flag(Some("ctf{heap_is_fun}"), 4, 9, id);
        assert_eq!(flag, format!("ctf{{heap_is_fun_{}}}", team_hash(4, 9, id)));

        let other_team = team_flag(Some("ctf{heap_is_fun}"), 5, 9, id);
        assert_ne!(flag, other_team);
    }
}
