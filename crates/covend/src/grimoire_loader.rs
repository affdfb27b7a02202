//! Loads grimoires and spells with project-dir-then-builtin precedence
//! (spec Section 6.6).

use coven_core::{Grimoire, GrimoireError};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error(transparent)]
    Grimoire(#[from] GrimoireError),
    #[error("spell not found: {0}")]
    SpellNotFound(String),
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, LoaderError>;

macro_rules! builtin_grimoire {
    ($name:literal) => {
        ($name, include_str!(concat!("../builtin/grimoires/", $name, ".yaml")))
    };
}

macro_rules! builtin_spell {
    ($name:literal) => {
        ($name, include_str!(concat!("../builtin/spells/", $name, ".md")))
    };
}

const BUILTIN_GRIMOIRES: &[(&str, &str)] = &[builtin_grimoire!("implement-bead")];

const BUILTIN_SPELLS: &[(&str, &str)] = &[builtin_spell!("implement"), builtin_spell!("fix-failure")];

/// Load a grimoire by name: project directory first, builtin fallback
/// (spec Section 6.6 loader precedence).
pub fn load_grimoire(grimoires_dir: &Path, name: &str) -> Result<Grimoire> {
    let project_path = grimoires_dir.join(format!("{name}.yaml"));
    if project_path.exists() {
        let yaml = std::fs::read_to_string(&project_path)
            .map_err(|source| LoaderError::Io { path: project_path.display().to_string(), source })?;
        return Ok(Grimoire::parse(name, &yaml)?);
    }

    if let Some((_, yaml)) = BUILTIN_GRIMOIRES.iter().find(|(n, _)| *n == name) {
        return Ok(Grimoire::parse(name, yaml)?);
    }

    Err(GrimoireError::NotFound(name.to_string()).into())
}

/// Resolve a spell reference to its rendered-template source. An inline
/// spell (detected by [`coven_core::AgentStep::is_inline`]) is returned
/// verbatim by the caller without going through this loader.
pub fn load_spell(spells_dir: &Path, name: &str) -> Result<String> {
    let project_path = spells_dir.join(format!("{name}.md"));
    if project_path.exists() {
        return std::fs::read_to_string(&project_path)
            .map_err(|source| LoaderError::Io { path: project_path.display().to_string(), source });
    }

    if let Some((_, body)) = BUILTIN_SPELLS.iter().find(|(n, _)| *n == name) {
        return Ok((*body).to_string());
    }

    Err(LoaderError::SpellNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn loads_builtin_grimoire_when_project_copy_absent() {
        let dir = TempDir::new().unwrap();
        let grimoire = load_grimoire(dir.path(), "implement-bead").unwrap();
        assert_eq!(grimoire.name, "implement-bead");
    }

    #[test]
    fn project_grimoire_overrides_builtin() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("implement-bead.yaml"),
            "name: implement-bead\ntimeout: \"5m\"\nsteps:\n  - name: only\n    type: script\n    command: \"true\"\n",
        )
        .unwrap();
        let grimoire = load_grimoire(dir.path(), "implement-bead").unwrap();
        assert_eq!(grimoire.steps.len(), 1);
    }

    #[test]
    fn unknown_grimoire_errors() {
        let dir = TempDir::new().unwrap();
        let err = load_grimoire(dir.path(), "does-not-exist").unwrap_err();
        assert!(matches!(err, LoaderError::Grimoire(GrimoireError::NotFound(_))));
    }

    #[test]
    fn loads_builtin_spell() {
        let dir = TempDir::new().unwrap();
        let spell = load_spell(dir.path(), "implement").unwrap();
        assert!(spell.contains("{{.task.title}}"));
    }

    #[test]
    fn unknown_spell_errors() {
        let dir = TempDir::new().unwrap();
        let err = load_spell(dir.path(), "nope").unwrap_err();
        assert!(matches!(err, LoaderError::SpellNotFound(_)));
    }
}
