//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Transactional update executor (spec §4.7). Operations within a transaction
//! are totally ordered; every operation backs up its destination before
//! mutating it; rollback restores backups in reverse order.

use crate::error::{ErrorKind, Result, UpdateError};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const COMPONENT: &str = "transaction";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Binary,
    Templates,
    Module,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Executing,
    Committed,
    RolledBack,
}

/// One filesystem mutation within a transaction: replace `destination_path`
/// with the contents of `source_path`, keeping a copy at `backup_path`.
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: ComponentKind,
    pub id: String,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub backup_path: PathBuf,
    pub state: OperationState,
    pub is_directory: bool,
}

impl Operation {
    /// A single-file replacement (the common case: the binary, a patch payload).
    pub fn new(
        kind: ComponentKind,
        id: impl Into<String>,
        source_path: impl Into<PathBuf>,
        destination_path: impl Into<PathBuf>,
        backup_path: impl Into<PathBuf>,
    ) -> Self {
        Operation {
            kind,
            id: id.into(),
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            backup_path: backup_path.into(),
            state: OperationState::Pending,
            is_directory: false,
        }
    }

    /// A whole-directory replacement (templates, a module's extracted tree).
    pub fn new_directory(
        kind: ComponentKind,
        id: impl Into<String>,
        source_path: impl Into<PathBuf>,
        destination_path: impl Into<PathBuf>,
        backup_path: impl Into<PathBuf>,
    ) -> Self {
        let mut op = Self::new(kind, id, source_path, destination_path, backup_path);
        op.is_directory = true;
        op
    }

    /// Back up the current destination (if present), then move the staged
    /// source atomically over it. The backup is written to persistent
    /// storage before the destination is mutated, as the state-machine
    /// invariant requires.
    fn execute(&mut self) -> Result<()> {
        self.state = OperationState::Executing;

        if self.destination_path.exists() {
            if let Some(parent) = self.backup_path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    UpdateError::filesystem(COMPONENT, "execute", format!("creating backup dir: {e}")).with_cause(e)
                })?;
            }
            if self.is_directory {
                copy_dir_recursive(&self.destination_path, &self.backup_path)?;
            } else {
                fs::copy(&self.destination_path, &self.backup_path).map_err(|e| {
                    UpdateError::filesystem(COMPONENT, "execute", format!("backing up {}: {e}", self.destination_path.display())).with_cause(e)
                })?;
            }
        }

        if let Some(parent) = self.destination_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                UpdateError::filesystem(COMPONENT, "execute", format!("creating destination dir: {e}")).with_cause(e)
            })?;
        }

        if self.is_directory {
            atomic_replace_directory(&self.source_path, &self.destination_path)?;
        } else {
            atomic_replace(&self.source_path, &self.destination_path)?;
        }
        Ok(())
    }

    /// Restore the backup over the destination, undoing `execute`.
    fn rollback(&mut self) -> Result<()> {
        if self.backup_path.exists() {
            if self.is_directory {
                atomic_replace_directory(&self.backup_path, &self.destination_path)?;
            } else {
                atomic_replace(&self.backup_path, &self.destination_path)?;
            }
        } else if self.destination_path.exists() {
            // No backup means the destination did not exist before execute; remove it.
            if self.is_directory {
                fs::remove_dir_all(&self.destination_path).map_err(|e| {
                    UpdateError::filesystem(COMPONENT, "rollback", format!("removing {}: {e}", self.destination_path.display())).with_cause(e)
                })?;
            } else {
                fs::remove_file(&self.destination_path).map_err(|e| {
                    UpdateError::filesystem(COMPONENT, "rollback", format!("removing {}: {e}", self.destination_path.display())).with_cause(e)
                })?;
            }
        }
        self.state = OperationState::RolledBack;
        Ok(())
    }
}

fn atomic_replace(staged: &Path, destination: &Path) -> Result<()> {
    match fs::rename(staged, destination) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Cross-device rename fails; fall back to copy-then-remove.
            fs::copy(staged, destination).map_err(|e| {
                UpdateError::filesystem(COMPONENT, "atomic_replace", format!("copying {} to {}: {e}", staged.display(), destination.display())).with_cause(e)
            })?;
            let _ = fs::remove_file(staged);
            Ok(())
        }
    }
}

/// Directory counterpart of `atomic_replace`. A rename works as long as
/// `destination` does not already exist; the caller must remove it first
/// (after backing it up) when replacing an existing directory in place.
fn atomic_replace_directory(staged: &Path, destination: &Path) -> Result<()> {
    if destination.exists() {
        fs::remove_dir_all(destination).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "atomic_replace_directory", format!("removing {}: {e}", destination.display())).with_cause(e)
        })?;
    }
    match fs::rename(staged, destination) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir_recursive(staged, destination)?;
            let _ = fs::remove_dir_all(staged);
            Ok(())
        }
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            UpdateError::filesystem(COMPONENT, "copy_dir_recursive", format!("walking {}: {e}", src.display()))
        })?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| {
                UpdateError::filesystem(COMPONENT, "copy_dir_recursive", format!("creating {}: {e}", target.display())).with_cause(e)
            })?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    UpdateError::filesystem(COMPONENT, "copy_dir_recursive", format!("creating {}: {e}", parent.display())).with_cause(e)
                })?;
            }
            fs::copy(entry.path(), &target).map_err(|e| {
                UpdateError::filesystem(COMPONENT, "copy_dir_recursive", format!("copying {} to {}: {e}", entry.path().display(), target.display())).with_cause(e)
            })?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Executed,
    Committed,
    RollingBack,
    RolledBack,
}

/// A verification hook run before any transaction state changes. Diagnostic
/// failures abort the apply before `begin` is ever called.
pub trait VerificationHook: Send + Sync {
    fn verify(&self) -> HookResult;
}

/// A pre- or post-apply hook run inside the transaction boundary.
pub trait TransactionHook: Send + Sync {
    fn run(&self, transaction: &Transaction) -> HookResult;
}

#[derive(Debug, Clone)]
pub struct HookResult {
    pub passed: bool,
    pub diagnostic: String,
}

impl HookResult {
    pub fn ok() -> Self {
        HookResult { passed: true, diagnostic: String::new() }
    }

    pub fn failed(diagnostic: impl Into<String>) -> Self {
        HookResult { passed: false, diagnostic: diagnostic.into() }
    }
}

/// Ordered set of operations applied as a unit, with backup-before-mutate and
/// reverse-order rollback on failure.
pub struct Transaction {
    pub state: TransactionState,
    operations: Vec<Operation>,
    executed_count: usize,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction { state: TransactionState::Open, operations: Vec::new(), executed_count: 0 }
    }

    /// Enqueue an operation. Only valid while the transaction is `Open`.
    pub fn add_operation(&mut self, operation: Operation) -> Result<()> {
        if self.state != TransactionState::Open {
            return Err(UpdateError::new(
                ErrorKind::ValidationFailure,
                COMPONENT,
                "add_operation",
                "cannot add an operation to a transaction that is no longer open",
            ));
        }
        self.operations.push(operation);
        Ok(())
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Run every operation's backup-then-apply in enqueued order. Any failure
    /// aborts further operations and transitions to `RollingBack`, then rolls
    /// back everything already executed, in reverse order.
    pub fn execute(&mut self) -> Result<()> {
        for (index, operation) in self.operations.iter_mut().enumerate() {
            if let Err(err) = operation.execute() {
                self.executed_count = index;
                self.state = TransactionState::RollingBack;
                let rollback_err = Self::rollback_executed(&mut self.operations[..index]);
                self.state = TransactionState::RolledBack;
                return match rollback_err {
                    Ok(()) => Err(err),
                    Err(rollback_failure) => Err(err.with_cause(rollback_failure)),
                };
            }
        }
        self.executed_count = self.operations.len();
        self.state = TransactionState::Executed;
        Ok(())
    }

    fn rollback_executed(executed: &mut [Operation]) -> std::result::Result<(), UpdateError> {
        let mut first_error = None;
        for operation in executed.iter_mut().rev() {
            if let Err(e) = operation.rollback() {
                // Filesystem failures during rollback are recorded, not re-raised;
                // rollback runs to completion best-effort (spec §7).
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Finalize a successfully executed transaction.
    pub fn commit(&mut self) -> Result<()> {
        if self.state != TransactionState::Executed {
            return Err(UpdateError::new(
                ErrorKind::ValidationFailure,
                COMPONENT,
                "commit",
                "cannot commit a transaction that has not finished executing",
            ));
        }
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Explicitly roll back an executed-but-not-committed transaction.
    pub fn rollback(&mut self) -> Result<()> {
        self.state = TransactionState::RollingBack;
        let result = Self::rollback_executed(&mut self.operations[..self.executed_count]);
        self.state = TransactionState::RolledBack;
        result
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// A pluggable differential-patch applier. The executor only depends on this
/// contract; the patch algorithm itself is an external collaborator.
pub trait PatchApplier: Send + Sync {
    fn apply(&self, patch_path: &Path, target_path: &Path) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn execute_then_commit_replaces_destination_and_keeps_backup() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("installed/binary");
        let staged = dir.path().join("staging/binary");
        let backup = dir.path().join("backup/binary");
        write(&dest, b"old");
        write(&staged, b"new");

        let mut tx = Transaction::new();
        tx.add_operation(Operation::new(ComponentKind::Binary, "core", &staged, &dest, &backup)).unwrap();
        tx.execute().unwrap();
        tx.commit().unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"new");
        assert_eq!(fs::read(&backup).unwrap(), b"old");
        assert_eq!(tx.state, TransactionState::Committed);
    }

    #[test]
    fn failed_operation_rolls_back_prior_operations_in_reverse_order() {
        let dir = tempdir().unwrap();
        let dest_a = dir.path().join("installed/a");
        let staged_a = dir.path().join("staging/a");
        let backup_a = dir.path().join("backup/a");
        write(&dest_a, b"a-old");
        write(&staged_a, b"a-new");

        let missing_staged = dir.path().join("staging/does-not-exist");
        let dest_b = dir.path().join("installed/b");
        let backup_b = dir.path().join("backup/b");
        write(&dest_b, b"b-old");

        let mut tx = Transaction::new();
        tx.add_operation(Operation::new(ComponentKind::Templates, "templates", &staged_a, &dest_a, &backup_a)).unwrap();
        tx.add_operation(Operation::new(ComponentKind::Module, "mod-a", &missing_staged, &dest_b, &backup_b)).unwrap();

        let result = tx.execute();
        assert!(result.is_err());
        assert_eq!(tx.state, TransactionState::RolledBack);
        // The first operation's destination must be byte-identical to its pre-execution content.
        assert_eq!(fs::read(&dest_a).unwrap(), b"a-old");
        assert_eq!(fs::read(&dest_b).unwrap(), b"b-old");
    }

    #[test]
    fn directory_operation_replaces_tree_and_backs_up_previous_one() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("installed/templates");
        let staged = dir.path().join("staging/templates");
        let backup = dir.path().join("backup/templates");
        write(&dest.join("a.yaml"), b"old-a");
        write(&staged.join("a.yaml"), b"new-a");
        write(&staged.join("nested/b.yaml"), b"new-b");

        let mut tx = Transaction::new();
        tx.add_operation(Operation::new_directory(ComponentKind::Templates, "templates", &staged, &dest, &backup)).unwrap();
        tx.execute().unwrap();
        tx.commit().unwrap();

        assert_eq!(fs::read(dest.join("a.yaml")).unwrap(), b"new-a");
        assert_eq!(fs::read(dest.join("nested/b.yaml")).unwrap(), b"new-b");
        assert_eq!(fs::read(backup.join("a.yaml")).unwrap(), b"old-a");
    }

    #[test]
    fn cannot_add_operation_after_execute() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("installed/x");
        let staged = dir.path().join("staging/x");
        let backup = dir.path().join("backup/x");
        write(&dest, b"old");
        write(&staged, b"new");

        let mut tx = Transaction::new();
        tx.add_operation(Operation::new(ComponentKind::Templates, "templates", &staged, &dest, &backup)).unwrap();
        tx.execute().unwrap();

        let extra = Operation::new(ComponentKind::Templates, "templates2", &staged, &dest, &backup);
        assert!(tx.add_operation(extra).is_err());
    }
}
