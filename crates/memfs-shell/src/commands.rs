//! Script commands and their execution against a file system

use std::io::Write;

use anyhow::{bail, Context, Result};
use memfs_core::{CopyOptions, FileType, MemoryFileSystem, OpenOptions};
use tracing::debug;

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Mkdir { path: String },
    Touch { path: String },
    Write { path: String, text: String },
    Append { path: String, text: String },
    Cat { path: String },
    Ls { path: String },
    Stat { path: String },
    Copy { source: String, target: String, force: bool },
    Move { source: String, target: String, force: bool },
    Link { existing: String, link: String },
    Symlink { target: String, link: String },
    Remove { path: String },
    Truncate { path: String, size: u64 },
    ReadLink { path: String },
    RealPath { path: String },
}

/// Split off the first whitespace-delimited word.
fn next_word(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    let end = input.find(char::is_whitespace).unwrap_or(input.len());
    Some((&input[..end], &input[end..]))
}

fn arg<'a>(rest: &mut &'a str, what: &str) -> Result<&'a str> {
    let (word, tail) = next_word(*rest).with_context(|| format!("missing {what}"))?;
    *rest = tail;
    Ok(word)
}

fn flag(rest: &mut &str, name: &str) -> bool {
    match next_word(*rest) {
        Some((word, tail)) if word == name => {
            *rest = tail;
            true
        }
        _ => false,
    }
}

fn no_more(rest: &str) -> Result<()> {
    if let Some((extra, _)) = next_word(rest) {
        bail!("unexpected argument '{extra}'");
    }
    Ok(())
}

/// Text argument: the rest of the line after one separating space.
fn text(rest: &str) -> String {
    rest.strip_prefix(' ').unwrap_or(rest).to_string()
}

impl Command {
    /// Parse one script line. Blank lines and `#` comments give `None`.
    pub fn parse(line: &str) -> Result<Option<Command>> {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some((name, mut rest)) = next_word(line) else {
            return Ok(None);
        };
        if name.starts_with('#') {
            return Ok(None);
        }
        let rest = &mut rest;

        let command = match name {
            "mkdir" => Command::Mkdir {
                path: arg(rest, "path")?.to_string(),
            },
            "touch" => Command::Touch {
                path: arg(rest, "path")?.to_string(),
            },
            "write" => Command::Write {
                path: arg(rest, "path")?.to_string(),
                text: text(rest),
            },
            "append" => Command::Append {
                path: arg(rest, "path")?.to_string(),
                text: text(rest),
            },
            "cat" => Command::Cat {
                path: arg(rest, "path")?.to_string(),
            },
            "ls" => {
                let path = match next_word(*rest) {
                    Some(_) => arg(rest, "path")?,
                    None => "/",
                };
                Command::Ls {
                    path: path.to_string(),
                }
            }
            "stat" => Command::Stat {
                path: arg(rest, "path")?.to_string(),
            },
            "cp" | "mv" => {
                let force = flag(rest, "-f");
                let source = arg(rest, "source")?.to_string();
                let target = arg(rest, "target")?.to_string();
                if name == "cp" {
                    Command::Copy { source, target, force }
                } else {
                    Command::Move { source, target, force }
                }
            }
            "ln" => {
                let symbolic = flag(rest, "-s");
                let existing = arg(rest, "target")?.to_string();
                let link = arg(rest, "link name")?.to_string();
                if symbolic {
                    Command::Symlink {
                        target: existing,
                        link,
                    }
                } else {
                    Command::Link { existing, link }
                }
            }
            "rm" => Command::Remove {
                path: arg(rest, "path")?.to_string(),
            },
            "truncate" => {
                let path = arg(rest, "path")?.to_string();
                let size = arg(rest, "size")?;
                let size = size
                    .parse()
                    .with_context(|| format!("invalid size '{size}'"))?;
                Command::Truncate { path, size }
            }
            "readlink" => Command::ReadLink {
                path: arg(rest, "path")?.to_string(),
            },
            "realpath" => Command::RealPath {
                path: arg(rest, "path")?.to_string(),
            },
            other => bail!("unknown command '{other}'"),
        };

        if !matches!(command, Command::Write { .. } | Command::Append { .. }) {
            no_more(rest)?;
        }
        Ok(Some(command))
    }

    /// Run against `fs`, writing any output to `out`.
    pub fn run(&self, fs: &MemoryFileSystem, out: &mut dyn Write) -> Result<()> {
        debug!(command = ?self, "running");
        match self {
            Command::Mkdir { path } => fs.create_directory(path)?,
            Command::Touch { path } => {
                fs.open(path, &OpenOptions::create())?.close()?;
            }
            Command::Write { path, text } => fs.write_all(path, text.as_bytes())?,
            Command::Append { path, text } => {
                let mut handle = fs.open(path, &OpenOptions::append())?;
                handle.write(text.as_bytes())?;
                handle.close()?;
            }
            Command::Cat { path } => {
                let contents = fs.read_all(path)?;
                out.write_all(&contents)?;
                if !contents.is_empty() && !contents.ends_with(b"\n") {
                    writeln!(out)?;
                }
            }
            Command::Ls { path } => {
                for entry in fs.read_dir(path)? {
                    let suffix = match entry.file_type {
                        FileType::Directory => "/",
                        FileType::Symlink => "@",
                        FileType::File => "",
                    };
                    writeln!(out, "{}{}", entry.name, suffix)?;
                }
            }
            Command::Stat { path } => {
                let attrs = fs.symlink_metadata(path)?;
                let kind = match attrs.file_type {
                    FileType::Directory => "directory",
                    FileType::Symlink => "symlink",
                    FileType::File => "file",
                };
                writeln!(
                    out,
                    "type={} size={} nlink={} mode={:o} uid={} gid={}",
                    kind, attrs.size, attrs.nlink, attrs.mode, attrs.uid, attrs.gid
                )?;
            }
            Command::Copy {
                source,
                target,
                force,
            } => fs.copy(source, target, copy_options(*force))?,
            Command::Move {
                source,
                target,
                force,
            } => fs.move_entry(source, target, copy_options(*force))?,
            Command::Link { existing, link } => fs.create_hard_link(link, existing)?,
            Command::Symlink { target, link } => fs.create_symlink(link, target)?,
            Command::Remove { path } => fs.delete(path)?,
            Command::Truncate { path, size } => fs.truncate(path, *size)?,
            Command::ReadLink { path } => writeln!(out, "{}", fs.read_link(path)?)?,
            Command::RealPath { path } => writeln!(out, "{}", fs.canonicalize(path)?)?,
        }
        Ok(())
    }
}

fn copy_options(force: bool) -> CopyOptions {
    CopyOptions {
        replace_existing: force,
        ..CopyOptions::default()
    }
}

/// Run every line of `script`, stopping at the first failure unless
/// `keep_going` is set. Returns the number of failed lines.
pub fn run_script(
    fs: &MemoryFileSystem,
    script: &str,
    keep_going: bool,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<usize> {
    let mut failures = 0;
    for (index, line) in script.lines().enumerate() {
        let number = index + 1;
        let outcome = Command::parse(line).and_then(|command| match command {
            Some(command) => command.run(fs, out),
            None => Ok(()),
        });
        if let Err(e) = outcome {
            if !keep_going {
                return Err(e.context(format!("line {number}: {}", line.trim())));
            }
            failures += 1;
            writeln!(err, "line {number}: {e:#}")?;
        }
    }
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memfs_core::FsConfig;

    fn run(script: &str) -> (String, String, usize) {
        let fs = MemoryFileSystem::new(FsConfig::default()).unwrap();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let failures = run_script(&fs, script, true, &mut out, &mut err).unwrap();
        (
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
            failures,
        )
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("   ").unwrap(), None);
        assert_eq!(Command::parse("# comment").unwrap(), None);
        assert_eq!(
            Command::parse("cp -f /a /b").unwrap(),
            Some(Command::Copy {
                source: "/a".into(),
                target: "/b".into(),
                force: true
            })
        );
        assert_eq!(
            Command::parse("write /f hello  world").unwrap(),
            Some(Command::Write {
                path: "/f".into(),
                text: "hello  world".into()
            })
        );
        assert_eq!(
            Command::parse("ln -s ../t /l").unwrap(),
            Some(Command::Symlink {
                target: "../t".into(),
                link: "/l".into()
            })
        );
        assert!(Command::parse("frobnicate /x").is_err());
        assert!(Command::parse("rm /a /b").is_err());
        assert!(Command::parse("truncate /a big").is_err());
    }

    #[test]
    fn test_copy_is_not_a_link() {
        let (out, err, failures) = run(
            "mkdir /a\n\
             write /a/b hello\n\
             cp /a/b /a/c\n\
             append /a/b !\n\
             cat /a/c\n\
             cat /a/b\n",
        );
        assert_eq!(failures, 0, "{err}");
        assert_eq!(out, "hello\nhello!\n");
    }

    #[test]
    fn test_listing_and_links() {
        let (out, err, failures) = run(
            "mkdir /d\n\
             touch /d/file\n\
             ln /d/file /d/hard\n\
             ln -s /d/file /d/soft\n\
             ls /d\n\
             stat /d/hard\n\
             readlink /d/soft\n\
             realpath /d/soft\n",
        );
        assert_eq!(failures, 0, "{err}");
        assert_eq!(
            out,
            "file\nhard\nsoft@\n\
             type=file size=0 nlink=2 mode=644 uid=0 gid=0\n\
             /d/file\n/d/file\n"
        );
    }

    #[test]
    fn test_failures_are_reported_per_line() {
        let (_, err, failures) = run("mkdir /a\nmkdir /a\nrm /missing\n");
        assert_eq!(failures, 2);
        assert!(err.contains("line 2: file already exists"), "{err}");
        assert!(err.contains("line 3: no such entry"), "{err}");
    }

    #[test]
    fn test_stop_at_first_failure() {
        let fs = MemoryFileSystem::new(FsConfig::default()).unwrap();
        let mut out = Vec::new();
        let mut err = Vec::new();
        let result = run_script(&fs, "rm /x\nmkdir /y\n", false, &mut out, &mut err);
        assert!(result.is_err());
        assert!(!fs.exists("/y"));
    }
}
