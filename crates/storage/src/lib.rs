mod repository;

pub use repository::{BackupRepository, ChecksumReport, CleanupReport, Listing, RepositoryInfo};
