//! Configuration readiness: credentials, dependencies, connectivity.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

use crate::bridge::CommandOutput;
use crate::error::{Error, Result};
use crate::parse::{FAILURE_MARKER, parse_error_line};
use crate::types::ConfigurationStatus;

/// Local readiness checks that do not contact the mail server.
#[derive(Debug, Clone)]
pub struct Readiness {
    credential_file: PathBuf,
    dependencies: Vec<String>,
}

impl Readiness {
    pub fn new(credential_file: PathBuf, dependencies: Vec<String>) -> Self {
        Self {
            credential_file,
            dependencies,
        }
    }

    pub fn credential_file(&self) -> &Path {
        &self.credential_file
    }

    pub fn credentials_present(&self) -> bool {
        self.credential_file.is_file()
    }

    /// Required binaries that are not on PATH, in configured order.
    pub fn check_dependencies(&self) -> Vec<String> {
        self.dependencies
            .iter()
            .filter(|name| which::which(name).is_err())
            .cloned()
            .collect()
    }

    /// Cheap readiness check without a connectivity probe.
    pub fn validate(&self) -> ConfigurationStatus {
        if !self.credentials_present() {
            return ConfigurationStatus::NotConfigured;
        }
        let missing = self.check_dependencies();
        if !missing.is_empty() {
            return ConfigurationStatus::MissingDependencies(missing);
        }
        ConfigurationStatus::Configured
    }

    /// Remove the credential file. A file that is already gone is fine.
    pub fn delete_credentials(&self) -> Result<()> {
        match fs::remove_file(&self.credential_file) {
            Ok(()) => {
                debug!("removed {}", self.credential_file.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Interpret the result of the `list` connectivity probe.
///
/// A zero exit with a failure marker and no message count in the output is
/// still a failure: the exporter reports some connection errors that way.
pub fn probe_status(result: Result<CommandOutput>) -> ConfigurationStatus {
    match result {
        Ok(output) => {
            let text = output.combined();
            if text.contains(FAILURE_MARKER) && !text.contains("messages") {
                ConfigurationStatus::Error(parse_error_line(&text))
            } else {
                ConfigurationStatus::Configured
            }
        }
        Err(err) => ConfigurationStatus::Error(err.summary()),
    }
}
