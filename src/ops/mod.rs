//! Assembly of external tool invocations: restic, gocryptfs, git.
//!
//! Pure string/argument building over typed profiles. Execution happens in
//! the job registry; nothing here touches a process.

pub mod gocryptfs;
pub mod git;
pub mod restic;
