use std::path::Path;

use crate::error::Result;

/// Flat `[section::name]` / `key=value` file as read by the emulator.
///
/// Sections and keys are written in insertion order. No comments, no quoting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniFile {
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl IniFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the named section, creating it at the end if missing.
    pub fn section(&mut self, name: &str) -> &mut Section {
        let idx = match self.sections.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.sections.push(Section {
                    name: name.to_string(),
                    entries: vec![],
                });
                self.sections.len() - 1
            }
        };
        &mut self.sections[idx]
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl ToString) -> &mut Self {
        self.section(section).set(key, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(|s| s.entries.is_empty())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push_str(&format!("[{}]\n", section.name));
            for (key, value) in &section.entries {
                out.push_str(&format!("{key}={value}\n"));
            }
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.render())?;
        Ok(())
    }
}

impl Section {
    /// Replaces an existing key in place, otherwise appends.
    pub fn set(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_sections_in_insertion_order() {
        let mut ini = IniFile::new();
        ini.set("user::general", "account_name", "gse orca")
            .set("user::general", "language", "english")
            .set("user::saves", "local_save_path", "./GSE Saves");

        assert_eq!(
            ini.render(),
            "[user::general]\naccount_name=gse orca\nlanguage=english\n\
             [user::saves]\nlocal_save_path=./GSE Saves\n"
        );
    }

    #[test]
    fn setting_a_key_twice_keeps_one_entry() {
        let mut ini = IniFile::new();
        ini.set("main::connectivity", "disable_lan_only", 0);
        ini.set("main::connectivity", "disable_lan_only", 1);
        assert_eq!(ini.render(), "[main::connectivity]\ndisable_lan_only=1\n");
    }

    #[test]
    fn section_without_entries_is_still_written() {
        let mut ini = IniFile::new();
        ini.section("app::dlcs");
        assert!(ini.is_empty());
        assert_eq!(ini.render(), "[app::dlcs]\n");
    }
}
