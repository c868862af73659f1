//! Emulated `fs` module, host side.
//!
//! Every operation is bridged: the host implements it against the real
//! filesystem, rooted at the invocation's package directory. Paths the guest
//! supplies are resolved under that root and refused with `EACCES` when the
//! canonicalized result escapes. The guest-side shim builds the sync,
//! callback, and promise variants plus `Stats` objects from these ops;
//! streams are explicitly unsupported there.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use rquickjs::function::{Func, Opt};
use rquickjs::{ArrayBuffer, Ctx, Object, Value};

use crate::pathsafe;
use crate::sandbox::bridge::{io_error_code, throw_code, value_to_bytes};
use crate::sandbox::state::GuestCell;

use super::GuestModule;

/// Resolve a guest path under the package root or throw `EACCES`.
fn resolve<'js>(ctx: &Ctx<'js>, state: &GuestCell, guest_path: &str) -> rquickjs::Result<PathBuf> {
    let root = state.borrow().package_root.clone();
    pathsafe::resolve_existing_under(&root, Path::new(guest_path)).ok_or_else(|| {
        throw_code(
            ctx,
            "EACCES",
            &format!("'{}' resolves outside the sandbox root", guest_path),
        )
    })
}

/// Translate an I/O failure into an errno-coded guest exception.
fn io_throw<'js>(ctx: &Ctx<'js>, guest_path: &str, e: std::io::Error) -> rquickjs::Error {
    throw_code(ctx, io_error_code(&e), &format!("{}, '{}'", e, guest_path))
}

fn system_time_ms(time: std::io::Result<std::time::SystemTime>) -> f64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

fn stat_object<'js>(
    ctx: &Ctx<'js>,
    guest_path: &str,
    metadata: std::io::Result<std::fs::Metadata>,
) -> rquickjs::Result<Object<'js>> {
    let metadata = metadata.map_err(|e| io_throw(ctx, guest_path, e))?;
    let stats = Object::new(ctx.clone())?;
    stats.set("size", metadata.len() as f64)?;
    stats.set("isFile", metadata.is_file())?;
    stats.set("isDirectory", metadata.is_dir())?;
    stats.set("isSymbolicLink", metadata.file_type().is_symlink())?;
    stats.set("mtimeMs", system_time_ms(metadata.modified()))?;
    stats.set("atimeMs", system_time_ms(metadata.accessed()))?;
    stats.set("birthtimeMs", system_time_ms(metadata.created()))?;
    stats.set("ctimeMs", system_time_ms(metadata.modified()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        stats.set("mode", metadata.mode())?;
        stats.set("uid", metadata.uid())?;
        stats.set("gid", metadata.gid())?;
    }
    Ok(stats)
}

fn open_options(flags: &str) -> Option<std::fs::OpenOptions> {
    let mut options = std::fs::OpenOptions::new();
    match flags {
        "r" => options.read(true),
        "r+" => options.read(true).write(true),
        "w" => options.write(true).create(true).truncate(true),
        "w+" => options.read(true).write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        "a+" => options.read(true).append(true).create(true),
        "wx" => options.write(true).create_new(true),
        _ => return None,
    };
    Some(options)
}

/// Emulated `fs` module.
pub struct FsModule;

impl GuestModule for FsModule {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn ops<'js>(&self, ctx: &Ctx<'js>, state: &GuestCell) -> rquickjs::Result<Object<'js>> {
        let ops = Object::new(ctx.clone())?;

        let st = state.clone();
        ops.set(
            "read",
            Func::from(move |ctx: Ctx<'js>, path: String| -> rquickjs::Result<ArrayBuffer<'js>> {
                let real = resolve(&ctx, &st, &path)?;
                let data = std::fs::read(&real).map_err(|e| io_throw(&ctx, &path, e))?;
                ArrayBuffer::new(ctx, data)
            }),
        )?;

        let st = state.clone();
        ops.set(
            "write",
            Func::from(
                move |ctx: Ctx<'js>, path: String, data: Value<'js>, append: bool| -> rquickjs::Result<()> {
                    let real = resolve(&ctx, &st, &path)?;
                    let bytes = value_to_bytes(&ctx, &data)?;
                    let result = if append {
                        std::fs::OpenOptions::new()
                            .append(true)
                            .create(true)
                            .open(&real)
                            .and_then(|mut f| f.write_all(&bytes))
                    } else {
                        std::fs::write(&real, &bytes)
                    };
                    result.map_err(|e| io_throw(&ctx, &path, e))
                },
            ),
        )?;

        let st = state.clone();
        ops.set(
            "stat",
            Func::from(
                move |ctx: Ctx<'js>, path: String, follow: bool| -> rquickjs::Result<Object<'js>> {
                    let real = resolve(&ctx, &st, &path)?;
                    let metadata = if follow {
                        std::fs::metadata(&real)
                    } else {
                        std::fs::symlink_metadata(&real)
                    };
                    stat_object(&ctx, &path, metadata)
                },
            ),
        )?;

        let st = state.clone();
        ops.set(
            "readdir",
            Func::from(move |ctx: Ctx<'js>, path: String| -> rquickjs::Result<Vec<String>> {
                let real = resolve(&ctx, &st, &path)?;
                let mut names = Vec::new();
                let entries = std::fs::read_dir(&real).map_err(|e| io_throw(&ctx, &path, e))?;
                for entry in entries {
                    let entry = entry.map_err(|e| io_throw(&ctx, &path, e))?;
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names.sort();
                Ok(names)
            }),
        )?;

        let st = state.clone();
        ops.set(
            "exists",
            Func::from(move |path: String| -> bool {
                let root = st.borrow().package_root.clone();
                pathsafe::resolve_existing_under(&root, Path::new(&path))
                    .map(|real| real.exists())
                    .unwrap_or(false)
            }),
        )?;

        let st = state.clone();
        ops.set(
            "access",
            Func::from(move |ctx: Ctx<'js>, path: String| -> rquickjs::Result<()> {
                let real = resolve(&ctx, &st, &path)?;
                if real.exists() {
                    Ok(())
                } else {
                    Err(throw_code(
                        &ctx,
                        "ENOENT",
                        &format!("no such file or directory, access '{}'", path),
                    ))
                }
            }),
        )?;

        let st = state.clone();
        ops.set(
            "mkdir",
            Func::from(
                move |ctx: Ctx<'js>, path: String, recursive: bool| -> rquickjs::Result<()> {
                    let real = resolve(&ctx, &st, &path)?;
                    let result = if recursive {
                        std::fs::create_dir_all(&real)
                    } else {
                        std::fs::create_dir(&real)
                    };
                    result.map_err(|e| io_throw(&ctx, &path, e))
                },
            ),
        )?;

        let st = state.clone();
        ops.set(
            "unlink",
            Func::from(move |ctx: Ctx<'js>, path: String| -> rquickjs::Result<()> {
                let real = resolve(&ctx, &st, &path)?;
                std::fs::remove_file(&real).map_err(|e| io_throw(&ctx, &path, e))
            }),
        )?;

        let st = state.clone();
        ops.set(
            "rmdir",
            Func::from(
                move |ctx: Ctx<'js>, path: String, recursive: bool| -> rquickjs::Result<()> {
                    let real = resolve(&ctx, &st, &path)?;
                    let result = if recursive {
                        std::fs::remove_dir_all(&real)
                    } else {
                        std::fs::remove_dir(&real)
                    };
                    result.map_err(|e| io_throw(&ctx, &path, e))
                },
            ),
        )?;

        let st = state.clone();
        ops.set(
            "rename",
            Func::from(move |ctx: Ctx<'js>, from: String, to: String| -> rquickjs::Result<()> {
                let real_from = resolve(&ctx, &st, &from)?;
                let real_to = resolve(&ctx, &st, &to)?;
                std::fs::rename(&real_from, &real_to).map_err(|e| io_throw(&ctx, &from, e))
            }),
        )?;

        let st = state.clone();
        ops.set(
            "copyFile",
            Func::from(move |ctx: Ctx<'js>, from: String, to: String| -> rquickjs::Result<()> {
                let real_from = resolve(&ctx, &st, &from)?;
                let real_to = resolve(&ctx, &st, &to)?;
                std::fs::copy(&real_from, &real_to)
                    .map(|_| ())
                    .map_err(|e| io_throw(&ctx, &from, e))
            }),
        )?;

        let st = state.clone();
        ops.set(
            "chmod",
            Func::from(move |ctx: Ctx<'js>, path: String, mode: u32| -> rquickjs::Result<()> {
                let real = resolve(&ctx, &st, &path)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(&real, std::fs::Permissions::from_mode(mode))
                        .map_err(|e| io_throw(&ctx, &path, e))
                }
                #[cfg(not(unix))]
                {
                    let _ = (real, mode);
                    Ok(())
                }
            }),
        )?;

        let st = state.clone();
        ops.set(
            "realpath",
            Func::from(move |ctx: Ctx<'js>, path: String| -> rquickjs::Result<String> {
                let real = resolve(&ctx, &st, &path)?;
                let root = st.borrow().package_root.clone();
                let guest = real
                    .strip_prefix(&root)
                    .map(|p| format!("/{}", p.display()))
                    .unwrap_or_else(|_| "/".to_string());
                Ok(guest)
            }),
        )?;

        let st = state.clone();
        ops.set(
            "open",
            Func::from(move |ctx: Ctx<'js>, path: String, flags: String| -> rquickjs::Result<i32> {
                let real = resolve(&ctx, &st, &path)?;
                let options = open_options(&flags).ok_or_else(|| {
                    throw_code(&ctx, "EINVAL", &format!("unsupported flags '{}'", flags))
                })?;
                let file = options.open(&real).map_err(|e| io_throw(&ctx, &path, e))?;
                Ok(st.borrow_mut().fds.insert(file))
            }),
        )?;

        let st = state.clone();
        ops.set(
            "close",
            Func::from(move |ctx: Ctx<'js>, fd: i32| -> rquickjs::Result<()> {
                match st.borrow_mut().fds.files.remove(&fd) {
                    Some(_) => Ok(()),
                    None => Err(throw_code(&ctx, "EBADF", &format!("bad file descriptor {}", fd))),
                }
            }),
        )?;

        let st = state.clone();
        ops.set(
            "readFd",
            Func::from(
                move |ctx: Ctx<'js>,
                      fd: i32,
                      length: usize,
                      position: Opt<i64>|
                      -> rquickjs::Result<ArrayBuffer<'js>> {
                    let mut guard = st.borrow_mut();
                    let file = guard.fds.files.get_mut(&fd).ok_or_else(|| {
                        throw_code(&ctx, "EBADF", &format!("bad file descriptor {}", fd))
                    })?;
                    if let Some(position) = position.0 {
                        file.seek(SeekFrom::Start(position.max(0) as u64))
                            .map_err(|e| io_throw(&ctx, "<fd>", e))?;
                    }
                    let mut buffer = vec![0u8; length.min(16 * 1024 * 1024)];
                    let read = file.read(&mut buffer).map_err(|e| io_throw(&ctx, "<fd>", e))?;
                    buffer.truncate(read);
                    drop(guard);
                    ArrayBuffer::new(ctx, buffer)
                },
            ),
        )?;

        let st = state.clone();
        ops.set(
            "writeFd",
            Func::from(
                move |ctx: Ctx<'js>, fd: i32, data: Value<'js>, position: Opt<i64>| -> rquickjs::Result<usize> {
                    let bytes = value_to_bytes(&ctx, &data)?;
                    let mut guard = st.borrow_mut();
                    let file = guard.fds.files.get_mut(&fd).ok_or_else(|| {
                        throw_code(&ctx, "EBADF", &format!("bad file descriptor {}", fd))
                    })?;
                    if let Some(position) = position.0 {
                        file.seek(SeekFrom::Start(position.max(0) as u64))
                            .map_err(|e| io_throw(&ctx, "<fd>", e))?;
                    }
                    file.write_all(&bytes).map_err(|e| io_throw(&ctx, "<fd>", e))?;
                    Ok(bytes.len())
                },
            ),
        )?;

        let st = state.clone();
        ops.set(
            "ftruncate",
            Func::from(move |ctx: Ctx<'js>, fd: i32, length: f64| -> rquickjs::Result<()> {
                let guard = st.borrow();
                let file = guard.fds.files.get(&fd).ok_or_else(|| {
                    throw_code(&ctx, "EBADF", &format!("bad file descriptor {}", fd))
                })?;
                file.set_len(length.max(0.0) as u64)
                    .map_err(|e| io_throw(&ctx, "<fd>", e))
            }),
        )?;

        Ok(ops)
    }
}
