#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
#![allow(renamed_and_removed_lints)]
#![allow(unknown_lints)]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)]
#![allow(clippy::result_large_err)]
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
#![allow(clippy::needless_lifetimes)]

use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub mod filenames;

/// What we were doing when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[non_exhaustive]
pub enum Action {
    /// Creating the state directory.
    #[display("initializing")]
    Initializing,
    /// Reading a state file.
    #[display("loading")]
    Loading,
    /// Writing a state file.
    #[display("storing")]
    Storing,
    /// Removing a state file.
    #[display("deleting")]
    Deleting,
}

/// An error that occurred while manipulating persistent state.
#[derive(Debug, thiserror::Error)]
#[error("{action} persistent state on {}", path.display())]
pub struct Error {
    /// What we were doing.
    action: Action,
    /// The file or directory involved.
    path: PathBuf,
    /// What went wrong.
    #[source]
    source: ErrorSource,
}

impl Error {
    /// Construct a new error.
    fn new(action: Action, path: impl Into<PathBuf>, source: impl Into<ErrorSource>) -> Self {
        Error {
            action,
            path: path.into(),
            source: source.into(),
        }
    }

    /// Return what we were doing when this error occurred.
    pub fn action(&self) -> Action {
        self.action
    }
}

/// Underlying cause of a state error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorSource {
    /// An IO error occurred.
    #[error("IO error")]
    Io(#[from] std::io::Error),
    /// JSON encoding or decoding failed.
    #[error("JSON serialization error")]
    Serde(#[from] serde_json::Error),
}

/// A directory of JSON state files.
///
/// Loads are tolerant: a missing or empty file reads as `None`.  Stores are
/// write-then-rename so readers never observe a torn document.
#[derive(Debug, Clone)]
pub struct FsDir {
    /// The state directory.
    dir: PathBuf,
}

impl FsDir {
    /// Open (creating if necessary) the state directory at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::new(Action::Initializing, &dir, e))?;
        Ok(FsDir { dir })
    }

    /// Return the path of `name` within this directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Return the state directory itself.
    pub fn root(&self) -> &Path {
        &self.dir
    }

    /// Load the JSON document in `name`.
    ///
    /// Returns `Ok(None)` if the file does not exist or is empty.
    pub fn get<D: DeserializeOwned>(&self, name: &str) -> Result<Option<D>, Error> {
        let path = self.path(name);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::new(Action::Loading, &path, e)),
        };
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(None);
        }
        let val = serde_json::from_slice(&bytes)
            .map_err(|e| Error::new(Action::Loading, &path, e))?;
        Ok(Some(val))
    }

    /// Store `val` as pretty-printed JSON in `name`.
    pub fn set<S: Serialize>(&self, name: &str, val: &S) -> Result<(), Error> {
        let path = self.path(name);
        let tmp = self.path(&format!("{}.tmp", name));
        let mut bytes = serde_json::to_vec_pretty(val)
            .map_err(|e| Error::new(Action::Storing, &path, e))?;
        bytes.push(b'\n');
        fs::write(&tmp, &bytes).map_err(|e| Error::new(Action::Storing, &tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| Error::new(Action::Storing, &path, e))
    }

    /// Delete `name`.  Deleting a file that does not exist is not an error.
    pub fn del(&self, name: &str) -> Result<(), Error> {
        let path = self.path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::new(Action::Deleting, &path, e)),
        }
    }

    /// Record the current process id in the pid file `name`.
    pub fn set_pid(&self, name: &str) -> Result<(), Error> {
        self.set(name, &std::process::id())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::useless_vec)]
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[test]
    fn simple() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsDir::new(dir.path()).unwrap();

        let stuff: HashMap<_, _> = vec![("hello".to_string(), "world".to_string())]
            .into_iter()
            .collect();
        store.set("xyz.json", &stuff).unwrap();

        let stuff2: Option<HashMap<String, String>> = store.get("xyz.json").unwrap();
        let nothing: Option<HashMap<String, String>> = store.get("abc.json").unwrap();

        assert_eq!(Some(stuff), stuff2);
        assert!(nothing.is_none());
        assert_eq!(store.root(), dir.path());
    }

    #[test]
    fn empty_file_is_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsDir::new(dir.path()).unwrap();
        std::fs::write(store.path("empty.json"), "  \n").unwrap();
        let got: Option<Vec<u32>> = store.get("empty.json").unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn corrupt_file_is_error() {
        #[derive(Deserialize, Debug)]
        struct Strict {
            #[allow(dead_code)]
            n: u32,
        }
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsDir::new(dir.path()).unwrap();
        std::fs::write(store.path("bad.json"), "{ not json").unwrap();
        let got: Result<Option<Strict>, _> = store.get("bad.json");
        assert_eq!(got.unwrap_err().action(), Action::Loading);
    }

    #[test]
    fn del_tolerates_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FsDir::new(dir.path()).unwrap();
        store.del("never-there.json").unwrap();
        store.set("x.json", &1_u32).unwrap();
        store.del("x.json").unwrap();
        let got: Option<u32> = store.get("x.json").unwrap();
        assert!(got.is_none());
    }
}
