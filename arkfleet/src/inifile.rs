//! Line-preserving `key=value` config documents.
//!
//! Game-server config files are INI-shaped: `[Section]` headers, `key=value`
//! pairs, `;`/`#` comments, meaningful blank lines. The core treats their
//! contents opaquely, but editors built on top need a parse/serialize cycle
//! that is byte-stable for every line it does not semantically alter, so
//! each parsed line keeps its raw text and only edited pairs are
//! regenerated.

use std::collections::HashMap;

/// One parsed line, with its original text.
#[derive(Debug, Clone, PartialEq, Eq)]
enum IniLine {
    Section { name: String, raw: String },
    Pair { key: String, value: String, raw: String },
    Comment { raw: String },
    Blank { raw: String },
}

/// A parsed config document.
#[derive(Debug, Clone)]
pub struct IniDocument {
    lines: Vec<IniLine>,
    newline: &'static str,
    trailing_newline: bool,
}

impl IniDocument {
    /// Parse a document. Never fails: lines that fit no known shape are kept
    /// verbatim as comments.
    pub fn parse(content: &str) -> Self {
        let newline = if content.contains("\r\n") { "\r\n" } else { "\n" };
        let trailing_newline = content.ends_with('\n');

        let mut lines = Vec::new();
        for raw in content.split(newline) {
            lines.push(Self::parse_line(raw));
        }
        // split() yields one empty trailing element when the content ends
        // with the separator; that element is not a line of the document.
        if trailing_newline {
            lines.pop();
        }

        Self {
            lines,
            newline,
            trailing_newline,
        }
    }

    fn parse_line(raw: &str) -> IniLine {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return IniLine::Blank {
                raw: raw.to_string(),
            };
        }
        if trimmed.starts_with(';') || trimmed.starts_with('#') {
            return IniLine::Comment {
                raw: raw.to_string(),
            };
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            return IniLine::Section {
                name: trimmed[1..trimmed.len() - 1].trim().to_string(),
                raw: raw.to_string(),
            };
        }
        if let Some((key, value)) = raw.split_once('=') {
            return IniLine::Pair {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
                raw: raw.to_string(),
            };
        }
        IniLine::Comment {
            raw: raw.to_string(),
        }
    }

    /// Look up a value. `section` of `None` searches the headerless prelude.
    pub fn get(&self, section: Option<&str>, key: &str) -> Option<&str> {
        let mut in_target = section.is_none();
        for line in &self.lines {
            match line {
                IniLine::Section { name, .. } => {
                    in_target = section.is_some_and(|wanted| name.eq_ignore_ascii_case(wanted));
                }
                IniLine::Pair { key: k, value, .. }
                    if in_target && k.eq_ignore_ascii_case(key) =>
                {
                    return Some(value);
                }
                _ => {}
            }
        }
        None
    }

    /// Set a value, altering only the matched pair line. A missing key is
    /// appended at the end of its section (the section header is created
    /// when absent).
    pub fn set(&mut self, section: Option<&str>, key: &str, value: &str) {
        let mut in_target = section.is_none();
        let mut insert_at = if section.is_none() {
            Some(self.prelude_end())
        } else {
            None
        };

        for (idx, line) in self.lines.iter_mut().enumerate() {
            match line {
                IniLine::Section { name, .. } => {
                    if in_target {
                        break;
                    }
                    in_target = section.is_some_and(|wanted| name.eq_ignore_ascii_case(wanted));
                    if in_target {
                        insert_at = Some(idx + 1);
                    }
                }
                IniLine::Pair { key: k, value: v, raw } if in_target => {
                    if k.eq_ignore_ascii_case(key) {
                        *v = value.to_string();
                        *raw = format!("{}={}", key, value);
                        return;
                    }
                    if insert_at.is_some() {
                        insert_at = Some(idx + 1);
                    }
                }
                _ => {}
            }
        }

        let pair = IniLine::Pair {
            key: key.to_string(),
            value: value.to_string(),
            raw: format!("{}={}", key, value),
        };

        match insert_at {
            Some(idx) => self.lines.insert(idx, pair),
            None => {
                // Section does not exist yet.
                if let Some(name) = section {
                    self.lines.push(IniLine::Section {
                        name: name.to_string(),
                        raw: format!("[{}]", name),
                    });
                }
                self.lines.push(pair);
            }
        }
    }

    /// Index just past the headerless prelude's last pair.
    fn prelude_end(&self) -> usize {
        let mut end = 0;
        for (idx, line) in self.lines.iter().enumerate() {
            match line {
                IniLine::Section { .. } => break,
                IniLine::Pair { .. } => end = idx + 1,
                _ => {}
            }
        }
        end
    }

    /// All section names, in order of appearance.
    pub fn sections(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                IniLine::Section { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Serialize, reproducing untouched lines byte-for-byte.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (idx, line) in self.lines.iter().enumerate() {
            let raw = match line {
                IniLine::Section { raw, .. }
                | IniLine::Pair { raw, .. }
                | IniLine::Comment { raw }
                | IniLine::Blank { raw } => raw,
            };
            out.push_str(raw);
            if idx + 1 < self.lines.len() || self.trailing_newline {
                out.push_str(self.newline);
            }
        }
        out
    }
}

/// Parse a flat `KEY=VALUE` environment file into a map.
///
/// Comments and malformed lines are skipped; values keep everything after
/// the first `=`, with surrounding whitespace and matching quotes removed.
pub fn parse_env(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }
        if let Some((key, value)) = trimmed.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            map.insert(key.to_string(), unquote(value.trim()).to_string());
        }
    }
    map
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "; server settings\n\
                          [ServerSettings]\n\
                          DifficultyOffset=1.0\n\
                          ; cap\n\
                          MaxPlayers = 70\n\
                          \n\
                          [SessionSettings]\n\
                          SessionName=My Ark\n";

    #[test]
    fn roundtrip_is_byte_stable() {
        let doc = IniDocument::parse(SAMPLE);
        assert_eq!(doc.render(), SAMPLE);
    }

    #[test]
    fn roundtrip_preserves_crlf_and_missing_trailing_newline() {
        let content = "[A]\r\nkey=value\r\n\r\n; done";
        let doc = IniDocument::parse(content);
        assert_eq!(doc.render(), content);
    }

    #[test]
    fn get_finds_values_case_insensitively() {
        let doc = IniDocument::parse(SAMPLE);
        assert_eq!(doc.get(Some("serversettings"), "maxplayers"), Some("70"));
        assert_eq!(doc.get(Some("SessionSettings"), "SessionName"), Some("My Ark"));
        assert_eq!(doc.get(Some("ServerSettings"), "SessionName"), None);
        assert_eq!(doc.get(None, "DifficultyOffset"), None);
    }

    #[test]
    fn set_alters_only_the_target_line() {
        let mut doc = IniDocument::parse(SAMPLE);
        doc.set(Some("ServerSettings"), "MaxPlayers", "100");

        let rendered = doc.render();
        assert!(rendered.contains("MaxPlayers=100"));
        // Every other line is untouched, including the comment above it.
        assert!(rendered.contains("; server settings\n"));
        assert!(rendered.contains("DifficultyOffset=1.0\n"));
        assert!(rendered.contains("SessionName=My Ark\n"));
    }

    #[test]
    fn set_appends_missing_key_inside_its_section() {
        let mut doc = IniDocument::parse(SAMPLE);
        doc.set(Some("ServerSettings"), "HarvestAmount", "2.0");

        let rendered = doc.render();
        let harvest = rendered.find("HarvestAmount=2.0").unwrap();
        let session = rendered.find("[SessionSettings]").unwrap();
        assert!(harvest < session);
    }

    #[test]
    fn set_creates_missing_section_at_end() {
        let mut doc = IniDocument::parse(SAMPLE);
        doc.set(Some("MessageOfTheDay"), "Message", "welcome");

        let rendered = doc.render();
        assert!(rendered.ends_with("[MessageOfTheDay]\nMessage=welcome\n"));
    }

    #[test]
    fn prelude_pairs_live_before_any_section() {
        let mut doc = IniDocument::parse("global=1\n[A]\nkey=2\n");
        doc.set(None, "another", "3");
        assert_eq!(
            doc.render(),
            "global=1\nanother=3\n[A]\nkey=2\n"
        );
    }

    #[test]
    fn junk_lines_survive_verbatim() {
        let content = "[A]\nkey=1\nthis line fits no shape\nkey2=2\n";
        let doc = IniDocument::parse(content);
        assert_eq!(doc.render(), content);
    }

    #[test]
    fn parse_env_skips_comments_and_junk() {
        let env = parse_env("# ports\nPORT=7777\nRCON_PORT = 27020\nbroken line\n=novalue\n");
        assert_eq!(env.get("PORT").map(String::as_str), Some("7777"));
        assert_eq!(env.get("RCON_PORT").map(String::as_str), Some("27020"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn parse_env_unquotes_values() {
        let env = parse_env("MAP_NAME=\"TheCenter\"\nSESSION='My Ark'\n");
        assert_eq!(env.get("MAP_NAME").map(String::as_str), Some("TheCenter"));
        assert_eq!(env.get("SESSION").map(String::as_str), Some("My Ark"));
    }
}
