use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Output, Stdio};

use anyhow::{bail, format_err, Context, Error};

/// One tree line as consumed and produced by `ls-tree` / `mktree`.
#[derive(Clone, Debug)]
pub struct TreeEntry {
    pub mode: String,
    pub otype: String,
    pub oid: String,
    pub name: String,
}

impl TreeEntry {
    pub fn blob(oid: &str, name: &str) -> Self {
        Self {
            mode: "100644".to_string(),
            otype: "blob".to_string(),
            oid: oid.to_string(),
            name: name.to_string(),
        }
    }

    pub fn subtree(oid: &str, name: &str) -> Self {
        Self {
            mode: "040000".to_string(),
            otype: "tree".to_string(),
            oid: oid.to_string(),
            name: name.to_string(),
        }
    }

    // "<mode> SP <type> SP <oid> TAB <name>"
    fn parse(line: &str) -> Result<Self, Error> {
        let (meta, name) = line
            .split_once('\t')
            .ok_or_else(|| format_err!("malformed tree entry {line:?}"))?;
        let mut parts = meta.split(' ');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(mode), Some(otype), Some(oid), None) => Ok(Self {
                mode: mode.to_string(),
                otype: otype.to_string(),
                oid: oid.to_string(),
                name: name.to_string(),
            }),
            _ => bail!("malformed tree entry {line:?}"),
        }
    }

    fn format(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(
            format!("{} {} {}\t{}\n", self.mode, self.otype, self.oid, self.name).as_bytes(),
        );
    }
}

/// Helper to check the result of a finished plumbing command.
///
/// The exit_code_check() function should return true if the exit code
/// is considered successful.
fn command_output(
    output: Output,
    exit_code_check: Option<fn(i32) -> bool>,
) -> Result<Vec<u8>, Error> {
    if !output.status.success() {
        match output.status.code() {
            Some(code) => {
                let is_ok = match exit_code_check {
                    Some(check_fn) => check_fn(code),
                    None => code == 0,
                };
                if !is_ok {
                    let msg = String::from_utf8_lossy(&output.stderr);
                    let msg = msg.trim();
                    if msg.is_empty() {
                        bail!("status code: {code} - no error message");
                    }
                    bail!("status code: {code} - {msg}");
                }
            }
            None => bail!("terminated by signal"),
        }
    }

    Ok(output.stdout)
}

fn run_command(
    mut command: Command,
    exit_code_check: Option<fn(i32) -> bool>,
) -> Result<Vec<u8>, Error> {
    let output = command
        .output()
        .map_err(|err| format_err!("failed to execute {command:?} - {err}"))?;

    command_output(output, exit_code_check)
        .map_err(|err| format_err!("command {command:?} failed - {err}"))
}

fn stdout_line(output: Vec<u8>) -> Result<String, Error> {
    let text =
        String::from_utf8(output).map_err(|_| format_err!("got non-utf8 plumbing output"))?;
    let line = text.trim_end();
    if line.is_empty() {
        bail!("got empty plumbing output");
    }
    Ok(line.to_string())
}

/// Handle on the repository the filter operates in.
///
/// Everything goes through git plumbing subprocesses with binary pipes;
/// child stdin is never inherited, so no child can swallow bytes of the
/// filter protocol running on our own standard streams.
pub struct GitRepo {
    work_dir: PathBuf,
    git_dir: PathBuf,
}

impl GitRepo {
    pub fn open<P: Into<PathBuf>>(work_dir: P) -> Result<Self, Error> {
        let work_dir = work_dir.into();
        let mut repo = Self {
            work_dir,
            git_dir: PathBuf::new(),
        };
        let out = repo
            .run(&["rev-parse", "--absolute-git-dir"], None)
            .context("not inside a git repository")?;
        repo.git_dir = PathBuf::from(stdout_line(out)?);
        Ok(repo)
    }

    /// Directory for request-scoped temp files, kept inside the
    /// repository so spill files share a filesystem with the objects.
    pub fn tmp_dir(&self) -> &Path {
        &self.git_dir
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new("git");
        command.current_dir(&self.work_dir);
        command.stdin(Stdio::null());
        command.args(args);
        command
    }

    fn run(
        &self,
        args: &[&str],
        exit_code_check: Option<fn(i32) -> bool>,
    ) -> Result<Vec<u8>, Error> {
        run_command(self.command(args), exit_code_check)
    }

    fn run_with_input(&self, args: &[&str], input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut child = self
            .command(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| format_err!("failed to execute git {} - {err}", args[0]))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| format_err!("no stdin handle on git {}", args[0]))?;
        stdin.write_all(input)?;
        drop(stdin); // the child reads until EOF

        let output = child.wait_with_output()?;
        command_output(output, None).map_err(|err| format_err!("git {} failed - {err}", args[0]))
    }

    /// `hash-object -w --stdin`: store a loose object, return its id.
    pub fn hash_object(&self, data: &[u8]) -> Result<String, Error> {
        let out = self.run_with_input(&["hash-object", "-w", "--stdin"], data)?;
        stdout_line(out).context("hash-object returned no digest")
    }

    /// Resolve a revision, `Ok(None)` when it does not exist.
    pub fn rev_parse(&self, rev: &str) -> Result<Option<String>, Error> {
        let out = self.run(
            &["rev-parse", "--verify", "--quiet", rev],
            Some(|code| code == 1),
        )?;
        let text = String::from_utf8_lossy(&out);
        let line = text.trim_end();
        if line.is_empty() {
            Ok(None)
        } else {
            Ok(Some(line.to_string()))
        }
    }

    pub fn ls_tree(&self, treeish: &str) -> Result<Vec<TreeEntry>, Error> {
        let out = self.run(&["ls-tree", treeish], None)?;
        let text =
            String::from_utf8(out).map_err(|_| format_err!("got non-utf8 ls-tree output"))?;
        text.lines().map(TreeEntry::parse).collect()
    }

    pub fn mktree(&self, entries: &[TreeEntry]) -> Result<String, Error> {
        let mut input = Vec::new();
        for entry in entries {
            entry.format(&mut input);
        }
        let out = self.run_with_input(&["mktree"], &input)?;
        stdout_line(out).context("mktree returned no tree id")
    }

    pub fn commit_tree(
        &self,
        tree: &str,
        parent: Option<&str>,
        message: &str,
    ) -> Result<String, Error> {
        let mut args = vec!["commit-tree", tree];
        if let Some(parent) = parent {
            args.push("-p");
            args.push(parent);
        }
        args.push("-m");
        args.push(message);

        let mut command = self.command(&args);
        command.env("GIT_AUTHOR_NAME", "git-fastcdc");
        command.env("GIT_AUTHOR_EMAIL", "git-fastcdc@localhost");
        command.env("GIT_COMMITTER_NAME", "git-fastcdc");
        command.env("GIT_COMMITTER_EMAIL", "git-fastcdc@localhost");

        let out = run_command(command, None)?;
        stdout_line(out).context("commit-tree returned no commit id")
    }

    /// Compare-and-swap a ref. `old = None` asserts the ref does not
    /// exist yet; any mismatch with the stored value makes git refuse
    /// the update.
    pub fn update_ref_cas(&self, refname: &str, new: &str, old: Option<&str>) -> Result<(), Error> {
        self.run(&["update-ref", refname, new, old.unwrap_or("")], None)?;
        Ok(())
    }

    pub fn config_get_bool(&self, key: &str) -> Result<Option<bool>, Error> {
        let out = self.run(
            &["config", "--type=bool", "--get", key],
            Some(|code| code == 1),
        )?;
        let text = String::from_utf8_lossy(&out);
        match text.trim_end() {
            "" => Ok(None),
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            other => bail!("unexpected boolean config value {other:?} for {key}"),
        }
    }

    /// Read an integer config value; git expands k/m/g suffixes.
    pub fn config_get_size(&self, key: &str) -> Result<Option<u64>, Error> {
        let out = self.run(
            &["config", "--type=int", "--get", key],
            Some(|code| code == 1),
        )?;
        let text = String::from_utf8_lossy(&out);
        let line = text.trim_end();
        if line.is_empty() {
            return Ok(None);
        }
        let value: i64 = line
            .parse()
            .map_err(|_| format_err!("unexpected integer config value {line:?} for {key}"))?;
        if value < 0 {
            bail!("config value {key} must not be negative");
        }
        Ok(Some(value as u64))
    }

    /// Spawn the long-lived object reader used for smudge lookups.
    pub fn cat_file_batch(&self) -> Result<CatFileBatch, Error> {
        let mut child = self
            .command(&["cat-file", "--batch"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| format_err!("failed to execute git cat-file --batch - {err}"))?;

        let input = child
            .stdin
            .take()
            .ok_or_else(|| format_err!("no stdin handle on git cat-file"))?;
        let output = child
            .stdout
            .take()
            .ok_or_else(|| format_err!("no stdout handle on git cat-file"))?;

        Ok(CatFileBatch {
            child,
            input,
            output: BufReader::new(output),
        })
    }
}

/// Long-lived `cat-file --batch` child, one lookup round trip per call.
pub struct CatFileBatch {
    child: Child,
    input: ChildStdin,
    output: BufReader<ChildStdout>,
}

impl CatFileBatch {
    /// Look up one object; `Ok(None)` when the name does not resolve.
    pub fn read_object(&mut self, name: &str) -> Result<Option<Vec<u8>>, Error> {
        self.input.write_all(name.as_bytes())?;
        self.input.write_all(b"\n")?;
        self.input.flush()?;

        let mut header = String::new();
        if self.output.read_line(&mut header)? == 0 {
            bail!("cat-file --batch terminated unexpectedly");
        }
        let header = header.trim_end();
        if header.ends_with(" missing") || header.ends_with(" ambiguous") {
            return Ok(None);
        }

        // "<oid> SP <type> SP <size>"
        let size = header
            .rsplit(' ')
            .next()
            .and_then(|field| field.parse::<usize>().ok())
            .ok_or_else(|| format_err!("unexpected cat-file --batch header {header:?}"))?;

        let mut data = vec![0u8; size];
        self.output.read_exact(&mut data)?;
        let mut newline = [0u8; 1];
        self.output.read_exact(&mut newline)?;

        Ok(Some(data))
    }
}

impl Drop for CatFileBatch {
    fn drop(&mut self) {
        // no zombie may outlive the session
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
