//! Scaffolding for new migration scripts

use schemaguard::migration::file::{parse_file_name, SCRIPT_EXTENSION, VERSION_NAME_DELIMITER};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScaffoldError {
    #[error("Invalid script name '{0}': use letters, digits and underscores")]
    InvalidName(String),

    #[error("Script already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("I/O error in {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Version for the next script in `dir`: one past the highest existing version
///
/// Files that are not migration scripts are ignored. A missing directory yields 1.
///
/// # Errors
///
/// Returns `ScaffoldError::Io` if the directory exists but cannot be read.
pub fn next_version(dir: &Path) -> Result<i32, ScaffoldError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(1),
        Err(source) => {
            return Err(ScaffoldError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let highest = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(SCRIPT_EXTENSION))
        .filter_map(|name| parse_file_name(&name).ok().map(|(version, _)| version))
        .max()
        .unwrap_or(0);
    Ok(highest.saturating_add(1))
}

/// `<version>_<name>.cql`, version zero-padded to three digits
pub fn script_file_name(version: i32, name: &str) -> Result<String, ScaffoldError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == VERSION_NAME_DELIMITER);
    if !valid {
        return Err(ScaffoldError::InvalidName(name.to_string()));
    }
    Ok(format!("{version:03}{VERSION_NAME_DELIMITER}{name}{SCRIPT_EXTENSION}"))
}

/// Create the next script in `dir`, creating the directory if needed
///
/// # Errors
///
/// Returns `ScaffoldError` for invalid names, existing files and I/O failures.
pub fn create_script(dir: &Path, name: &str) -> Result<PathBuf, ScaffoldError> {
    let version = next_version(dir)?;
    let path = dir.join(script_file_name(version, name)?);
    if path.exists() {
        return Err(ScaffoldError::AlreadyExists(path));
    }

    fs::create_dir_all(dir).map_err(|source| ScaffoldError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let template = format!(
        "-- Migration {version}: {name}\n\
         -- Statements are separated by ';'. Applied scripts must not be edited.\n\n"
    );
    fs::write(&path, template).map_err(|source| ScaffoldError::Io {
        path: path.clone(),
        source,
    })?;
    log::debug!("Created {}", path.display());
    Ok(path)
}
