//! MdStatReader: parses `/proc/mdstat` into structured `MdArray` records.
//!
//! The grammar is three fixed line shapes (header, size line, optional
//! resync line) plus a leading personalities line and a trailing unused-
//! devices line — not a recursive grammar, so this is a hand-written
//! line-oriented parser rather than a parser-combinator dependency, matching
//! how the reference stack treats other kernel-text formats.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use regex::Regex;
use std::sync::OnceLock;

use crate::domain::{MdArray, ResyncInfo, ResyncKind};
use crate::fsreader::FSReader;

fn size_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d+) blocks.*?(?:\[(\d+)/(\d+)\])?\s*(\[[U_S]+\])?\s*$").unwrap()
    })
}

fn resync_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(resync|recovery|check)\s*=\s*([\d.]+)%\s*\((\d+)/(\d+)\)(?:\s*finish=([\d.]+)min)?(?:\s*speed=(\S+))?",
        )
        .unwrap()
    })
}

#[derive(Debug, Clone, Default)]
pub struct MdStatSnapshot {
    pub personalities: Vec<String>,
    pub arrays: BTreeMap<String, MdArray>,
    pub unused_devices: Vec<String>,
}

pub struct MdStatReader {
    fsreader: Arc<FSReader>,
    cache: RwLock<Option<(MdStatSnapshot, Instant)>>,
}

impl MdStatReader {
    pub fn new(fsreader: Arc<FSReader>) -> Self {
        Self {
            fsreader,
            cache: RwLock::new(None),
        }
    }

    pub async fn snapshot(&self) -> MdStatSnapshot {
        let raw = self.fsreader.read_proc_with_cat_fallback("mdstat").await;
        parse_mdstat(&raw)
    }

    pub async fn get_array(&self, name: &str) -> Option<MdArray> {
        self.snapshot().await.arrays.get(name).cloned()
    }
}

/// Parses the textual contents of `/proc/mdstat`.
pub fn parse_mdstat(raw: &str) -> MdStatSnapshot {
    let mut snapshot = MdStatSnapshot::default();
    let lines: Vec<&str> = raw.lines().collect();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i].trim_end();

        if let Some(rest) = line.strip_prefix("Personalities :") {
            snapshot.personalities = rest
                .split_whitespace()
                .map(|p| p.trim_start_matches('[').trim_end_matches(']').to_string())
                .collect();
            i += 1;
            continue;
        }

        if let Some(rest) = line.strip_prefix("unused devices:") {
            let rest = rest.trim();
            if rest != "<none>" && !rest.is_empty() {
                snapshot.unused_devices = rest.split_whitespace().map(|s| s.to_string()).collect();
            }
            i += 1;
            continue;
        }

        if let Some(colon_idx) = line.find(':') {
            let name = line[..colon_idx].trim_end();
            let header_rest = line[colon_idx + 1..].trim_start();
            if name.starts_with("md") && !name.is_empty() && !name.contains(' ') {
                let mut array = parse_header_line(name, header_rest);

                if i + 1 < lines.len() {
                    let size_line = lines[i + 1].trim();
                    apply_size_line(&mut array, size_line);
                    i += 1;
                }

                if i + 1 < lines.len() {
                    if let Some(resync) = parse_resync_line(lines[i + 1]) {
                        array.resync = Some(resync);
                        i += 1;
                    }
                }

                snapshot.arrays.insert(array.name.clone(), array);
                i += 1;
                continue;
            }
        }

        i += 1;
    }

    snapshot
}

fn parse_header_line(name: &str, rest: &str) -> MdArray {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    // rest shape: "<state> <level> <dev[role]> <dev[role]> ..."
    if tokens.is_empty() {
        return MdArray {
            name: name.to_string(),
            state: String::new(),
            is_active: false,
            ..Default::default()
        };
    }

    let state = tokens[0].to_string();
    let is_active = state == "active";
    let (level, devices) = if tokens.len() > 1 && tokens[1].starts_with("raid")
        || tokens.get(1).map(|t| *t == "linear" || *t == "multipath").unwrap_or(false)
    {
        (Some(tokens[1].to_string()), tokens[2..].iter().map(|s| s.to_string()).collect())
    } else {
        (None, tokens[1..].iter().map(|s| s.to_string()).collect())
    };

    MdArray {
        name: name.to_string(),
        state,
        is_active,
        level,
        devices,
        ..Default::default()
    }
}

fn apply_size_line(array: &mut MdArray, line: &str) {
    if let Some(caps) = size_line_re().captures(line) {
        if let Some(blocks) = caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok()) {
            array.size_bytes = blocks * 1024;
        }
        if let (Some(active), Some(total)) = (caps.get(2), caps.get(3)) {
            array.active_devices = active.as_str().parse().unwrap_or(0);
            array.total_devices = total.as_str().parse().unwrap_or(0);
        }
        if let Some(slots) = caps.get(4) {
            let chars: Vec<char> = slots.as_str().trim_matches(|c| c == '[' || c == ']').chars().collect();
            array.working_devices = chars.iter().filter(|&&c| c == 'U').count() as u32;
            array.failed_devices = chars.iter().filter(|&&c| c == '_').count() as u32;
            array.spare_devices = chars.iter().filter(|&&c| c == 'S').count() as u32;
            array.slots = chars;
        }
    }
}

fn parse_resync_line(line: &str) -> Option<ResyncInfo> {
    let caps = resync_line_re().captures(line)?;
    let kind = match caps.get(1)?.as_str() {
        "resync" => ResyncKind::Resync,
        "recovery" => ResyncKind::Recovery,
        "check" => ResyncKind::Check,
        _ => return None,
    };
    let percent: f64 = caps.get(2)?.as_str().parse().ok()?;
    let finish_minutes = caps.get(5).and_then(|m| m.as_str().parse().ok());
    let speed = caps.get(6).map(|m| m.as_str().to_string());
    Some(ResyncInfo {
        kind,
        percent,
        finish_minutes,
        speed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Personalities : [raid1] [raid0]
md0 : active raid1 sdb1[1] sda1[0]
      1048576 blocks super 1.2 [2/2] [UU]

unused devices: <none>
";

    const RESYNCING: &str = "\
Personalities : [raid1]
md127 : active raid1 sdc1[1] sdd1[0]
      976631296 blocks super 1.2 [2/2] [UU]
      [=====>..............]  resync = 29.4% (287552/976631296) finish=102.3min speed=45678K/sec

unused devices: <none>
";

    const DEGRADED: &str = "\
Personalities : [raid1]
md0 : active raid1 sda1[0]
      1048576 blocks super 1.2 [2/1] [U_]

unused devices: <none>
";

    #[test]
    fn parses_personalities() {
        let snap = parse_mdstat(SAMPLE);
        assert_eq!(snap.personalities, vec!["raid1", "raid0"]);
    }

    #[test]
    fn parses_simple_active_array() {
        let snap = parse_mdstat(SAMPLE);
        let md0 = snap.arrays.get("md0").unwrap();
        assert_eq!(md0.state, "active");
        assert!(md0.is_active);
        assert_eq!(md0.level.as_deref(), Some("raid1"));
        assert_eq!(md0.devices, vec!["sdb1[1]", "sda1[0]"]);
        assert_eq!(md0.size_bytes, 1048576 * 1024);
        assert_eq!(md0.active_devices, 2);
        assert_eq!(md0.total_devices, 2);
        assert_eq!(md0.slots, vec!['U', 'U']);
    }

    #[test]
    fn parses_resync_progress() {
        let snap = parse_mdstat(RESYNCING);
        let md = snap.arrays.get("md127").unwrap();
        let resync = md.resync.as_ref().unwrap();
        assert_eq!(resync.kind, ResyncKind::Resync);
        assert!((resync.percent - 29.4).abs() < 0.001);
        assert_eq!(resync.finish_minutes, Some(102.3));
        assert_eq!(resync.speed.as_deref(), Some("45678K/sec"));
    }

    #[test]
    fn parses_degraded_array_slots() {
        let snap = parse_mdstat(DEGRADED);
        let md = snap.arrays.get("md0").unwrap();
        assert_eq!(md.slots, vec!['U', '_']);
        assert_eq!(md.working_devices, 1);
        assert_eq!(md.failed_devices, 1);
    }

    #[test]
    fn unused_devices_none_is_empty_list() {
        let snap = parse_mdstat(SAMPLE);
        assert!(snap.unused_devices.is_empty());
    }

    #[test]
    fn unparseable_header_still_emits_a_record_with_empty_state() {
        // Malformed header line missing the state/level tokens entirely.
        let raw = "md3 : \n      0 blocks\n\nunused devices: <none>\n";
        let snap = parse_mdstat(raw);
        let md3 = snap.arrays.get("md3").unwrap();
        assert_eq!(md3.state, "");
        assert!(!md3.is_active);
    }
}
