//! GPU requirement extraction from script text

use gpulet_core::ScriptType;
use regex::Regex;
use tracing::debug;

/// Extracts the CUDA device indices a python script names in its text.
///
/// Patterns are matched over the raw source without executing anything.
/// Shell scripts are never parsed: they export `CUDA_VISIBLE_DEVICES`
/// themselves at run time.
pub struct RequirementExtractor {
    patterns: Vec<Regex>,
}

impl RequirementExtractor {
    /// Compile the recognized CUDA binding idioms
    pub fn new() -> Self {
        let patterns = [
            // os.environ['CUDA_VISIBLE_DEVICES'] = "0,1"
            r#"os\.environ\[\s*['"]CUDA_VISIBLE_DEVICES['"]\s*\]\s*=\s*['"]([^'"]*)['"]"#,
            // os.environ.setdefault('CUDA_VISIBLE_DEVICES', "0,1")
            r#"os\.environ\.setdefault\(\s*['"]CUDA_VISIBLE_DEVICES['"]\s*,\s*['"]([^'"]*)['"]\s*\)"#,
            // torch.cuda.set_device(1)
            r"torch\.cuda\.set_device\(\s*(\d+)\s*\)",
            // torch.device("cuda:1")
            r#"torch\.device\(\s*['"]cuda:(\d+)['"]\s*\)"#,
        ];
        Self {
            patterns: patterns
                .iter()
                .map(|p| Regex::new(p).expect("device pattern compiles"))
                .collect(),
        }
    }

    /// Return the devices the script binds itself to, in first-seen order.
    ///
    /// When several patterns match, the one appearing last in the file wins,
    /// mirroring "last assignment before execution" semantics. An empty
    /// result means the script names no devices.
    pub fn extract(&self, script_type: ScriptType, text: &str) -> Vec<u32> {
        if script_type != ScriptType::Python {
            return Vec::new();
        }

        let mut matches: Vec<(usize, &str)> = Vec::new();
        for pattern in &self.patterns {
            for caps in pattern.captures_iter(text) {
                if let (Some(whole), Some(spec)) = (caps.get(0), caps.get(1)) {
                    matches.push((whole.start(), spec.as_str()));
                }
            }
        }
        matches.sort_by_key(|(start, _)| *start);

        let mut devices = Vec::new();
        for (_, spec) in matches {
            let parsed = parse_device_spec(spec);
            // a match that parses to nothing never overrides an earlier one
            if !parsed.is_empty() {
                devices = parsed;
            }
        }
        if !devices.is_empty() {
            debug!(devices = ?devices, "Script names CUDA devices");
        }
        devices
    }
}

impl Default for RequirementExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a `CUDA_VISIBLE_DEVICES`-style device list.
///
/// Comma-separated tokens, each a bare index or an inclusive `A-B` range.
/// Malformed tokens are dropped rather than failing the whole spec;
/// duplicates are removed preserving first-seen order.
pub fn parse_device_spec(spec: &str) -> Vec<u32> {
    let mut devices: Vec<u32> = Vec::new();
    let mut push = |devices: &mut Vec<u32>, index: u32| {
        if !devices.contains(&index) {
            devices.push(index);
        }
    };

    for token in spec.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = token.split_once('-') {
            match (lo.trim().parse::<u32>(), hi.trim().parse::<u32>()) {
                (Ok(lo), Ok(hi)) if lo <= hi => {
                    for index in lo..=hi {
                        push(&mut devices, index);
                    }
                }
                _ => debug!(token, "Dropping malformed device range"),
            }
        } else {
            match token.parse::<u32>() {
                Ok(index) => push(&mut devices, index),
                Err(_) => debug!(token, "Dropping malformed device token"),
            }
        }
    }
    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_and_ranges() {
        assert_eq!(parse_device_spec("0,1,3-5"), vec![0, 1, 3, 4, 5]);
        assert_eq!(parse_device_spec("2-2"), vec![2]);
        assert_eq!(parse_device_spec("2"), vec![2]);
        assert_eq!(parse_device_spec(" 0 , 2 "), vec![0, 2]);
    }

    #[test]
    fn test_parse_drops_malformed_tokens() {
        assert_eq!(parse_device_spec("5-2"), Vec::<u32>::new());
        assert_eq!(parse_device_spec("a,1"), vec![1]);
        assert_eq!(parse_device_spec("one-two"), Vec::<u32>::new());
        assert_eq!(parse_device_spec(""), Vec::<u32>::new());
        assert_eq!(parse_device_spec("0,x,3-1,2"), vec![0, 2]);
    }

    #[test]
    fn test_parse_deduplicates() {
        assert_eq!(parse_device_spec("1,0,1,0-2"), vec![1, 0, 2]);
    }

    #[test]
    fn test_extract_environ_assignment() {
        let extractor = RequirementExtractor::new();
        let text = "import os\nos.environ['CUDA_VISIBLE_DEVICES'] = '0,1'\n";
        assert_eq!(extractor.extract(ScriptType::Python, text), vec![0, 1]);

        let text = "import os\nos.environ[\"CUDA_VISIBLE_DEVICES\"] = \"2-3\"\n";
        assert_eq!(extractor.extract(ScriptType::Python, text), vec![2, 3]);
    }

    #[test]
    fn test_extract_setdefault() {
        let extractor = RequirementExtractor::new();
        let text = "os.environ.setdefault('CUDA_VISIBLE_DEVICES', '3')\n";
        assert_eq!(extractor.extract(ScriptType::Python, text), vec![3]);
    }

    #[test]
    fn test_extract_framework_calls() {
        let extractor = RequirementExtractor::new();
        let text = "import torch\ntorch.cuda.set_device(2)\n";
        assert_eq!(extractor.extract(ScriptType::Python, text), vec![2]);

        let text = "device = torch.device('cuda:1')\n";
        assert_eq!(extractor.extract(ScriptType::Python, text), vec![1]);
    }

    #[test]
    fn test_last_match_wins() {
        let extractor = RequirementExtractor::new();
        let text = "os.environ['CUDA_VISIBLE_DEVICES'] = '0,1'\n\
                    torch.cuda.set_device(3)\n";
        assert_eq!(extractor.extract(ScriptType::Python, text), vec![3]);
    }

    #[test]
    fn test_malformed_last_match_keeps_previous() {
        let extractor = RequirementExtractor::new();
        let text = "os.environ['CUDA_VISIBLE_DEVICES'] = '0,1'\n\
                    os.environ['CUDA_VISIBLE_DEVICES'] = 'none'\n";
        assert_eq!(extractor.extract(ScriptType::Python, text), vec![0, 1]);
    }

    #[test]
    fn test_shell_scripts_are_not_parsed() {
        let extractor = RequirementExtractor::new();
        let text = "export CUDA_VISIBLE_DEVICES=0,1\n./train\n";
        assert!(extractor.extract(ScriptType::Shell, text).is_empty());
        assert!(extractor.extract(ScriptType::Unknown, text).is_empty());
    }

    #[test]
    fn test_no_match_yields_empty() {
        let extractor = RequirementExtractor::new();
        let text = "print('hello')\n";
        assert!(extractor.extract(ScriptType::Python, text).is_empty());
    }
}
