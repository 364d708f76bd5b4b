/// Parser for Proxmox-style sectioned configuration files: a header line
/// `kind: name` followed by indented `key value` lines. Duplicate keys are
/// meaningful and kept in order. Anything before the first header (user
/// edits, comments) is ignored trivia.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub kind: String,
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl Section {
    pub fn first(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.first(key).is_some()
    }
}

pub fn parse_sections(text: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let indented = line.starts_with(' ') || line.starts_with('\t');

        if !indented {
            if let Some((kind, name)) = split_header(line) {
                sections.push(Section {
                    kind,
                    name,
                    entries: Vec::new(),
                });
            }
            // non-header top-level lines are tolerated and dropped
            continue;
        }

        let Some(current) = sections.last_mut() else {
            continue;
        };
        let trimmed = line.trim();
        match trimmed.split_once(char::is_whitespace) {
            Some((k, v)) => current
                .entries
                .push((k.to_string(), v.trim().to_string())),
            None => current.entries.push((trimmed.to_string(), String::new())),
        }
    }

    sections
}

fn split_header(line: &str) -> Option<(String, String)> {
    let (kind, name) = line.split_once(':')?;
    let kind = kind.trim();
    let name = name.trim();
    if kind.is_empty() || name.is_empty() || kind.contains(char::is_whitespace) {
        return None;
    }
    Some((kind.to_string(), name.to_string()))
}
