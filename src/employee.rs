use crate::error::{RecordError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One entry of the employee directory.
///
/// `employee_id` is the display identifier ("EMP001"); the remote API wants
/// its numeric part. `rank` 1 marks an administrator badge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Employee {
    pub employee_id: String,
    pub name: String,
    pub rfid: String,
    #[serde(default = "default_rank")]
    pub rank: u8,
}

fn default_rank() -> u8 {
    2
}

impl Employee {
    pub fn is_admin(&self) -> bool {
        self.rank == 1
    }

    /// Numeric id the remote API expects ("EMP001" -> 1).
    pub fn numeric_id(&self) -> std::result::Result<i64, RecordError> {
        let digits: String = self
            .employee_id
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        digits
            .parse()
            .map_err(|_| RecordError::InvalidEmployeeId {
                id: self.employee_id.clone(),
            })
    }
}

/// The directory file ships either as a bare array or wrapped in an
/// `{"employees": [...]}` object; accept both.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DirectoryFile {
    Wrapped { employees: Vec<Employee> },
    Bare(Vec<Employee>),
}

impl DirectoryFile {
    fn into_employees(self) -> Vec<Employee> {
        match self {
            DirectoryFile::Wrapped { employees } => employees,
            DirectoryFile::Bare(employees) => employees,
        }
    }
}

/// In-memory employee directory keyed by badge identifier.
///
/// Reloaded between sessions only; the session tracker works on cloned
/// snapshots so a mid-session reload never changes an active session.
pub struct EmployeeDirectory {
    path: PathBuf,
    by_rfid: HashMap<String, Employee>,
}

impl EmployeeDirectory {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut directory = Self {
            path: path.as_ref().to_path_buf(),
            by_rfid: HashMap::new(),
        };
        directory.reload()?;
        Ok(directory)
    }

    /// Re-read the directory file. A missing file yields an empty directory
    /// (fresh installation before enrolment).
    pub fn reload(&mut self) -> Result<()> {
        if !self.path.exists() {
            warn!(
                "Employee directory {} not found, starting empty",
                self.path.display()
            );
            self.by_rfid.clear();
            return Ok(());
        }

        let raw = std::fs::read_to_string(&self.path)?;
        let parsed: DirectoryFile = serde_json::from_str(&raw)?;
        let employees = parsed.into_employees();

        self.by_rfid.clear();
        for employee in employees {
            if employee.rfid.is_empty() {
                debug!("Skipping {} (no badge assigned)", employee.employee_id);
                continue;
            }
            if let Some(previous) = self
                .by_rfid
                .insert(employee.rfid.clone(), employee.clone())
            {
                warn!(
                    "Badge {} assigned to both {} and {}, keeping the latter",
                    employee.rfid, previous.employee_id, employee.employee_id
                );
            }
        }

        info!(
            "Loaded {} employees from {}",
            self.by_rfid.len(),
            self.path.display()
        );
        Ok(())
    }

    pub fn lookup(&self, uid: &str) -> Option<&Employee> {
        self.by_rfid.get(uid)
    }

    /// Whether any rank-1 badge exists. The UI falls back to a PIN entry
    /// point when none does.
    pub fn has_admin(&self) -> bool {
        self.by_rfid.values().any(Employee::is_admin)
    }

    pub fn len(&self) -> usize {
        self.by_rfid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_rfid.is_empty()
    }
}

impl std::fmt::Debug for EmployeeDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmployeeDirectory")
            .field("path", &self.path)
            .field("entries", &self.by_rfid.len())
            .finish()
    }
}
