pub mod codec;
pub mod cron;

use std::ffi::OsStr;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result};
use pg_backup_core::{BackupError, BackupFormat};
use serde::Deserialize;
use tracing::{debug, info};

/// Where and as whom the external tools connect.
///
/// Handed to every tool invocation as-is; the password travels through
/// `PGPASSWORD` and never appears on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl ConnectionSettings {
    fn apply(&self, cmd: &mut Command) {
        cmd.arg("-h")
            .arg(&self.host)
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-U")
            .arg(&self.user)
            .arg("-w");
        if let Some(password) = &self.password {
            cmd.env("PGPASSWORD", password);
        }
    }
}

/// Program names for the external tools. Bare names are looked up on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub pg_dump: PathBuf,
    pub pg_restore: PathBuf,
    pub psql: PathBuf,
    pub dropdb: PathBuf,
    pub createdb: PathBuf,
    pub crontab: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            pg_dump: "pg_dump".into(),
            pg_restore: "pg_restore".into(),
            psql: "psql".into(),
            dropdb: "dropdb".into(),
            createdb: "createdb".into(),
            crontab: "crontab".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpOptions {
    /// Passed to `pg_dump -Z` for custom archives.
    pub compression_level: u32,
    /// Passed to `-j` for directory archives, on dump and on restore.
    pub parallel_jobs: u32,
    pub verbose: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            compression_level: 6,
            parallel_jobs: 4,
            verbose: false,
        }
    }
}

/// Runs the PostgreSQL client tools against one database.
#[derive(Debug, Clone)]
pub struct PgTools {
    conn: ConnectionSettings,
    paths: ToolPaths,
}

impl PgTools {
    pub fn new(conn: ConnectionSettings, paths: ToolPaths) -> Self {
        Self { conn, paths }
    }

    pub fn connection(&self) -> &ConnectionSettings {
        &self.conn
    }

    pub fn dump_command(&self, target: &Path, format: BackupFormat, opts: &DumpOptions) -> Command {
        let mut cmd = Command::new(&self.paths.pg_dump);
        self.conn.apply(&mut cmd);
        cmd.arg("-d").arg(&self.conn.database);
        match format {
            BackupFormat::Sql => {}
            BackupFormat::Custom => {
                cmd.args(["-F", "c", "-Z"])
                    .arg(opts.compression_level.to_string());
            }
            BackupFormat::Directory => {
                cmd.args(["-F", "d", "-j"]).arg(opts.parallel_jobs.to_string());
            }
            BackupFormat::Tar => {
                cmd.args(["-F", "t"]);
            }
        }
        cmd.arg("-f").arg(target);
        if opts.verbose {
            cmd.arg("-v");
        }
        cmd
    }

    /// Dumps the database into `target`, which must not exist yet.
    pub fn dump(&self, target: &Path, format: BackupFormat, opts: &DumpOptions) -> Result<()> {
        info!(
            database = %self.conn.database,
            format = %format,
            target = %target.display(),
            "running pg_dump"
        );
        run("pg_dump", &mut self.dump_command(target, format, opts))?;
        Ok(())
    }

    /// Builds the restore invocation for an uncompressed artifact.
    pub fn restore_command(&self, source: &Path, format: BackupFormat, opts: &DumpOptions) -> Command {
        match format {
            BackupFormat::Sql => {
                let mut cmd = self.psql_command();
                cmd.arg("-f").arg(source);
                cmd
            }
            BackupFormat::Custom | BackupFormat::Directory | BackupFormat::Tar => {
                let mut cmd = Command::new(&self.paths.pg_restore);
                self.conn.apply(&mut cmd);
                cmd.arg("-d")
                    .arg(&self.conn.database)
                    .args(["-c", "--if-exists"]);
                if format == BackupFormat::Directory {
                    cmd.arg("-j").arg(opts.parallel_jobs.to_string());
                }
                if opts.verbose {
                    cmd.arg("-v");
                }
                cmd.arg(source);
                cmd
            }
        }
    }

    /// Restores `source` into the target database.
    ///
    /// A compressed SQL script is decoded on the fly into psql's stdin.
    pub fn restore(
        &self,
        source: &Path,
        format: BackupFormat,
        compressed: bool,
        opts: &DumpOptions,
    ) -> Result<()> {
        info!(
            database = %self.conn.database,
            format = %format,
            compressed,
            source = %source.display(),
            "restoring backup"
        );
        if compressed {
            return self.restore_compressed_sql(source);
        }
        let tool = match format {
            BackupFormat::Sql => "psql",
            _ => "pg_restore",
        };
        run(tool, &mut self.restore_command(source, format, opts))?;
        Ok(())
    }

    fn restore_compressed_sql(&self, source: &Path) -> Result<()> {
        let mut stderr_sink = tempfile::tempfile().context("create stderr buffer for psql")?;
        let mut cmd = self.psql_command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::from(
                stderr_sink.try_clone().context("clone stderr buffer")?,
            ));
        log_invocation("psql", &cmd);

        let mut child = cmd.spawn().map_err(|e| spawn_failure("psql", &e))?;
        let copied = match child.stdin.take() {
            Some(mut stdin) => codec::decode_into(source, &mut stdin),
            None => Ok(()),
        };
        let status = child.wait().context("wait for psql")?;

        if !status.success() {
            let mut stderr = String::new();
            stderr_sink.seek(SeekFrom::Start(0)).context("rewind stderr buffer")?;
            stderr_sink
                .read_to_string(&mut stderr)
                .context("read psql stderr")?;
            return Err(BackupError::ExternalTool {
                tool: "psql".to_owned(),
                code: status.code(),
                stderr: stderr.trim().to_owned(),
            }
            .into());
        }
        copied.with_context(|| format!("decompress {}", source.display()))
    }

    pub fn drop_database(&self) -> Result<()> {
        let mut cmd = Command::new(&self.paths.dropdb);
        self.conn.apply(&mut cmd);
        cmd.arg("--if-exists").arg(&self.conn.database);
        info!(database = %self.conn.database, "dropping database");
        run("dropdb", &mut cmd)?;
        Ok(())
    }

    pub fn create_database(&self) -> Result<()> {
        let mut cmd = Command::new(&self.paths.createdb);
        self.conn.apply(&mut cmd);
        cmd.arg(&self.conn.database);
        info!(database = %self.conn.database, "creating database");
        run("createdb", &mut cmd)?;
        Ok(())
    }

    /// `SELECT version()` through psql; `None` when the server cannot be asked.
    pub fn server_version(&self) -> Option<String> {
        let mut cmd = self.psql_command();
        cmd.args(["-t", "-A", "-c", "SELECT version();"]);
        match run("psql", &mut cmd) {
            Ok(output) => {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_owned();
                (!version.is_empty()).then_some(version)
            }
            Err(e) => {
                debug!(error = %e, "could not query server version");
                None
            }
        }
    }

    fn psql_command(&self) -> Command {
        let mut cmd = Command::new(&self.paths.psql);
        self.conn.apply(&mut cmd);
        cmd.arg("-d")
            .arg(&self.conn.database)
            .args(["-q", "-v", "ON_ERROR_STOP=1"]);
        cmd
    }
}

/// Runs `cmd` to completion; a non-zero exit becomes [`BackupError::ExternalTool`].
pub fn run(tool: &str, cmd: &mut Command) -> Result<Output> {
    log_invocation(tool, cmd);
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| spawn_failure(tool, &e))?;

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    if !output.status.success() {
        return Err(BackupError::ExternalTool {
            tool: tool.to_owned(),
            code: output.status.code(),
            stderr,
        }
        .into());
    }
    if !stderr.is_empty() {
        debug!(tool, %stderr, "tool diagnostics");
    }
    Ok(output)
}

fn log_invocation(tool: &str, cmd: &Command) {
    // Not `{cmd:?}`: Command's Debug output includes PGPASSWORD.
    let args: Vec<&OsStr> = cmd.get_args().collect();
    debug!(tool, program = ?cmd.get_program(), ?args, "executing");
}

fn spawn_failure(tool: &str, err: &std::io::Error) -> anyhow::Error {
    BackupError::ExternalTool {
        tool: tool.to_owned(),
        code: None,
        stderr: format!("could not start: {err}"),
    }
    .into()
}

/// Opens a file for reading with the path in the error context.
pub(crate) fn open(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("open {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools() -> PgTools {
        PgTools::new(
            ConnectionSettings {
                host: "db.internal".to_owned(),
                port: 5433,
                user: "backup".to_owned(),
                password: Some("s3cret".to_owned()),
                database: "shop".to_owned(),
            },
            ToolPaths::default(),
        )
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn dump_flags_follow_format() {
        let tools = tools();
        let opts = DumpOptions {
            compression_level: 9,
            parallel_jobs: 8,
            verbose: true,
        };

        let custom = tools.dump_command(Path::new("/b/x.dump"), BackupFormat::Custom, &opts);
        assert_eq!(custom.get_program(), "pg_dump");
        assert_eq!(
            args(&custom),
            vec![
                "-h", "db.internal", "-p", "5433", "-U", "backup", "-w", "-d", "shop", "-F", "c",
                "-Z", "9", "-f", "/b/x.dump", "-v"
            ]
        );

        let dir = tools.dump_command(Path::new("/b/x"), BackupFormat::Directory, &opts);
        assert!(args(&dir).windows(4).any(|w| w == ["-F", "d", "-j", "8"]));

        let sql = tools.dump_command(Path::new("/b/x.sql"), BackupFormat::Sql, &DumpOptions::default());
        assert!(!args(&sql).contains(&"-F".to_owned()));
        assert!(!args(&sql).contains(&"-v".to_owned()));
    }

    #[test]
    fn password_goes_through_env_not_argv() {
        let cmd = tools().dump_command(Path::new("/b/x.tar"), BackupFormat::Tar, &DumpOptions::default());
        assert!(!args(&cmd).iter().any(|a| a.contains("s3cret")));
        let env: Vec<_> = cmd.get_envs().collect();
        assert_eq!(env, vec![(OsStr::new("PGPASSWORD"), Some(OsStr::new("s3cret")))]);
    }

    #[test]
    fn restore_picks_psql_or_pg_restore() {
        let tools = tools();
        let opts = DumpOptions::default();

        let sql = tools.restore_command(Path::new("/b/x.sql"), BackupFormat::Sql, &opts);
        assert_eq!(sql.get_program(), "psql");
        let sql_args = args(&sql);
        assert!(sql_args.windows(2).any(|w| w == ["-v", "ON_ERROR_STOP=1"]));
        assert_eq!(&sql_args[sql_args.len() - 2..], ["-f", "/b/x.sql"]);

        let dir = tools.restore_command(Path::new("/b/x"), BackupFormat::Directory, &opts);
        assert_eq!(dir.get_program(), "pg_restore");
        let dir_args = args(&dir);
        assert!(dir_args.contains(&"--if-exists".to_owned()));
        assert!(dir_args.windows(2).any(|w| w == ["-j", "4"]));
        assert_eq!(dir_args.last().map(String::as_str), Some("/b/x"));
    }

    #[test]
    fn missing_program_is_an_external_tool_error() {
        let mut cmd = Command::new("/nonexistent/pg_dump");
        let err = run("pg_dump", &mut cmd).unwrap_err();
        match err.downcast_ref::<BackupError>() {
            Some(BackupError::ExternalTool { tool, code, .. }) => {
                assert_eq!(tool, "pg_dump");
                assert_eq!(*code, None);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_carries_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo 'pg_dump: error: connection refused' >&2; exit 1"]);
        let err = run("pg_dump", &mut cmd).unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert!(err.to_string().contains("exit code 1"));
    }
}
