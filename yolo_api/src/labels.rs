use regex::Regex;
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

/// Id to name table of the loaded model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassNames {
    names: Vec<String>,
}

impl ClassNames {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Parses the `names` entry Ultralytics writes into exported model metadata,
    /// e.g. `{0: 'person', 1: 'bicycle', 2: "yellow_lady's_slipper"}`.
    pub fn from_metadata(names: &str) -> Option<Self> {
        let re = Regex::new(r#"(\d+)\s*:\s*(?:'([^']*)'|"([^"]*)")"#).ok()?;
        let mut entries: Vec<(usize, String)> = re
            .captures_iter(names)
            .filter_map(|caps| {
                let id = caps.get(1)?.as_str().parse().ok()?;
                let name = caps.get(2).or_else(|| caps.get(3))?.as_str().to_string();
                Some((id, name))
            })
            .collect();

        if entries.is_empty() {
            return None;
        }
        entries.sort_by_key(|(id, _)| *id);

        let len = entries.last().map(|(id, _)| id + 1).unwrap_or_default();
        let mut table: Vec<String> = (0..len).map(fallback_name).collect();
        for (id, name) in entries {
            table[id] = name;
        }
        Some(Self::new(table))
    }

    /// One class name per line, the line number being the class id.
    pub fn from_file(filepath: &Path) -> io::Result<Self> {
        let file = File::open(filepath)?;
        let reader = io::BufReader::new(file);
        let mut names = Vec::new();

        for line_result in reader.lines() {
            let line = line_result?;
            let label = line.trim();
            if label.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Empty label on line {}", names.len() + 1),
                ));
            }
            names.push(label.to_string());
        }

        Ok(Self::new(names))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, class_id: usize) -> String {
        self.names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| fallback_name(class_id))
    }
}

fn fallback_name(class_id: usize) -> String {
    format!("class {}", class_id)
}
