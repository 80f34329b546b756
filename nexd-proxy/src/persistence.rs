//! Whenever the set of `stored` rules changes, the full set is re-serialised to disk — one
//! canonical string per line, trailing newline — atomically (write-tmp-then-rename, via
//! `atomicwrites`, grounded on the teacher's `bin-shared::device_id` persistence idiom).

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use crate::rule::{Direction, ProxyRule};

const RULES_FILE: &str = "proxy_rules";

pub fn rules_path(state_dir: &Path) -> PathBuf {
    state_dir.join(RULES_FILE)
}

/// Serialises `rules`, sorted by canonical form for byte-reproducibility, to the state
/// directory. Only `stored` rules participate.
pub fn persist(state_dir: &Path, rules: &[ProxyRule]) -> Result<()> {
    let mut lines: Vec<String> = rules
        .iter()
        .filter(|r| r.stored)
        .map(|r| format!("{}:{}", direction_tag(r.direction), r.canonical()))
        .collect();
    lines.sort();

    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }

    let path = rules_path(state_dir);
    let file = atomicwrites::AtomicFile::new(&path, atomicwrites::OverwriteBehavior::AllowOverwrite);
    file.write(|f| std::io::Write::write_all(f, content.as_bytes()))
        .with_context(|| format!("failed to persist proxy rules to {}", path.display()))?;

    Ok(())
}

/// Replays the persisted rule file, one rule per line, in the order it was written. Returns an
/// empty vec if the file does not exist (first run).
pub fn load(state_dir: &Path) -> Result<Vec<ProxyRule>> {
    let path = rules_path(state_dir);
    let Ok(content) = std::fs::read_to_string(&path) else {
        return Ok(Vec::new());
    };

    let mut rules = Vec::new();
    for line in content.lines().filter(|l| !l.is_empty()) {
        let (direction, rest) = line
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("malformed persisted rule: {line}"))?;
        let direction = parse_direction_tag(direction)
            .ok_or_else(|| anyhow::anyhow!("malformed persisted rule direction: {line}"))?;
        let rule = ProxyRule::parse(direction, rest, true)
            .with_context(|| format!("malformed persisted rule: {line}"))?;
        rules.push(rule);
    }

    Ok(rules)
}

fn direction_tag(direction: Direction) -> &'static str {
    match direction {
        Direction::Ingress => "ingress",
        Direction::Egress => "egress",
    }
}

fn parse_direction_tag(s: &str) -> Option<Direction> {
    match s {
        "ingress" => Some(Direction::Ingress),
        "egress" => Some(Direction::Egress),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_read_round_trips_stored_set() {
        let dir = tempdir().unwrap();

        let rules = vec![
            ProxyRule::parse(Direction::Ingress, "tcp:8080:10.0.0.5:80", true).unwrap(),
            ProxyRule::parse(Direction::Egress, "udp:53:9.9.9.9:53", true).unwrap(),
        ];

        persist(dir.path(), &rules).unwrap();
        let reloaded = load(dir.path()).unwrap();

        let mut expected: Vec<_> = rules.clone();
        expected.sort_by_key(|r| format!("{}:{}", direction_tag(r.direction), r.canonical()));

        assert_eq!(reloaded, expected);
    }

    #[test]
    fn transient_rules_are_not_persisted() {
        let dir = tempdir().unwrap();
        let rules = vec![ProxyRule::parse(Direction::Ingress, "tcp:8080:10.0.0.5:80", false).unwrap()];

        persist(dir.path(), &rules).unwrap();
        let reloaded = load(dir.path()).unwrap();

        assert!(reloaded.is_empty());
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_empty());
    }
}
