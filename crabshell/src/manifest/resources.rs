use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::debug;

use super::xml::Document;

/// `@string/<name>` → text.
pub type StringTable = BTreeMap<String, String>;

/// Reads every `values*/strings.xml` under a decoded `res/` directory.
/// Files that do not parse are skipped. Qualifier directories are visited in
/// name order and the first definition wins, so plain `values/` takes
/// precedence over locale variants.
pub fn load_string_table(res_dir: &Path) -> StringTable {
    let mut table = StringTable::new();
    let Ok(entries) = fs::read_dir(res_dir) else {
        return table;
    };

    let mut dirs: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("values"))
        })
        .collect();
    dirs.sort();

    for dir in dirs {
        let path = dir.join("strings.xml");
        let Ok(source) = fs::read_to_string(&path) else {
            continue;
        };
        let document = match Document::parse(&source) {
            Ok(document) => document,
            Err(error) => {
                debug!("skipping {}: {error}", path.display());
                continue;
            }
        };
        for node in document.root.elements().filter(|node| node.name == "string") {
            let Some(name) = node.attr("name").filter(|name| !name.is_empty()) else {
                continue;
            };
            let text = node.text();
            if !text.is_empty() {
                table.entry(name.to_string()).or_insert(text);
            }
        }
    }
    table
}
