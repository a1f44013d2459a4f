//! Process args, environment, working dir, and user identity.

use berth_runtime::supervisor::ImageConfig;
use berth_schema::flags::{merge_env, parse_user, read_env_file};
use berth_schema::{OptionsError, RunOptions};
use std::path::Path;

/// Where the init binary lives inside the container.
pub const INIT_PATH: &str = "/sbin/tini";

/// Final argv: entrypoint then command, with the image supplying whatever
/// the user did not. `--entrypoint ""` clears the image entrypoint and its cmd.
pub fn process_args(opts: &RunOptions, image: &ImageConfig) -> Result<Vec<String>, OptionsError> {
    let mut args: Vec<String> = match &opts.entrypoint {
        Some(ep) => {
            let mut args = ep.clone();
            args.extend(opts.args.iter().cloned());
            args
        }
        None => {
            let mut args = image.entrypoint.clone();
            if opts.args.is_empty() {
                args.extend(image.cmd.iter().cloned());
            } else {
                args.extend(opts.args.iter().cloned());
            }
            args
        }
    };
    if args.is_empty() {
        return Err(OptionsError::Invalid(
            "no command specified: the image has neither entrypoint nor cmd".to_owned(),
        ));
    }
    if opts.init {
        args.splice(0..0, [INIT_PATH.to_owned(), "--".to_owned()]);
    }
    Ok(args)
}

/// Environment in precedence order: image, `HOSTNAME`, env files, `-e`.
/// A bare `-e KEY` takes the value from `lookup`, and is dropped when unset.
pub fn process_env(
    opts: &RunOptions,
    image: &ImageConfig,
    hostname: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Vec<String>, OptionsError> {
    let mut entries: Vec<String> = vec![berth_runtime::oci::DEFAULT_PATH_ENV.to_owned()];
    entries.extend(image.env.iter().cloned());
    if !hostname.is_empty() {
        entries.push(format!("HOSTNAME={hostname}"));
    }
    for file in &opts.env_files {
        entries.extend(read_env_file(file)?);
    }
    for e in &opts.env {
        if e.contains('=') {
            if e.starts_with('=') {
                return Err(OptionsError::Invalid(format!("invalid environment variable '{e}'")));
            }
            entries.push(e.clone());
        } else if let Some(v) = lookup(e) {
            entries.push(format!("{e}={v}"));
        }
    }
    Ok(merge_env(entries))
}

pub fn working_dir(opts: &RunOptions, image: &ImageConfig) -> Result<String, OptionsError> {
    let cwd = opts
        .workdir
        .clone()
        .filter(|w| !w.is_empty())
        .or_else(|| Some(image.working_dir.clone()).filter(|w| !w.is_empty()))
        .unwrap_or_else(|| "/".to_owned());
    if !cwd.starts_with('/') {
        return Err(OptionsError::Invalid(format!(
            "working directory '{cwd}' must be an absolute path"
        )));
    }
    Ok(cwd)
}

pub fn parse_umask(s: &str) -> Result<u32, OptionsError> {
    let mask = u32::from_str_radix(s, 8)
        .map_err(|_| OptionsError::Invalid(format!("invalid umask '{s}'")))?;
    if mask > 0o777 {
        return Err(OptionsError::Invalid(format!("umask '{s}' out of range")));
    }
    Ok(mask)
}

/// Resolved numeric identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
}

struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
}

struct GroupEntry {
    name: String,
    gid: u32,
    members: Vec<String>,
}

fn read_passwd(rootfs: Option<&Path>) -> Vec<PasswdEntry> {
    let Some(content) = rootfs.and_then(|r| std::fs::read_to_string(r.join("etc/passwd")).ok())
    else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| {
            let f: Vec<&str> = line.split(':').collect();
            Some(PasswdEntry {
                name: (*f.first()?).to_owned(),
                uid: f.get(2)?.parse().ok()?,
                gid: f.get(3)?.parse().ok()?,
            })
        })
        .collect()
}

fn read_groups(rootfs: Option<&Path>) -> Vec<GroupEntry> {
    let Some(content) = rootfs.and_then(|r| std::fs::read_to_string(r.join("etc/group")).ok())
    else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| {
            let f: Vec<&str> = line.split(':').collect();
            Some(GroupEntry {
                name: (*f.first()?).to_owned(),
                gid: f.get(2)?.parse().ok()?,
                members: f
                    .get(3)
                    .map(|m| m.split(',').filter(|s| !s.is_empty()).map(str::to_owned).collect())
                    .unwrap_or_default(),
            })
        })
        .collect()
}

fn lookup_group(group: &str, groups: &[GroupEntry]) -> Result<u32, OptionsError> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }
    groups
        .iter()
        .find(|g| g.name == group)
        .map(|g| g.gid)
        .ok_or_else(|| OptionsError::Invalid(format!("no such group '{group}' in the image")))
}

/// Resolve `--user` (or the image user) and `--group-add` against the
/// image's `/etc/passwd` and `/etc/group`.
pub fn resolve_identity(
    user: Option<&str>,
    group_add: &[String],
    rootfs: Option<&Path>,
) -> Result<Identity, OptionsError> {
    let passwd = read_passwd(rootfs);
    let groups = read_groups(rootfs);
    let mut id = Identity::default();
    let mut name: Option<String> = None;

    if let Some(user) = user.filter(|u| !u.is_empty()) {
        let spec = parse_user(user)?;
        if let Ok(uid) = spec.user.parse::<u32>() {
            id.uid = uid;
            let entry = passwd.iter().find(|p| p.uid == uid);
            id.gid = entry.map_or(0, |p| p.gid);
            name = entry.map(|p| p.name.clone());
        } else {
            let entry = passwd
                .iter()
                .find(|p| p.name == spec.user)
                .ok_or_else(|| {
                    OptionsError::Invalid(format!("no such user '{}' in the image", spec.user))
                })?;
            id.uid = entry.uid;
            id.gid = entry.gid;
            name = Some(entry.name.clone());
        }
        if let Some(group) = &spec.group {
            id.gid = lookup_group(group, &groups)?;
        }
    }

    if let Some(name) = &name {
        for g in groups.iter().filter(|g| g.members.contains(name)) {
            if g.gid != id.gid && !id.additional_gids.contains(&g.gid) {
                id.additional_gids.push(g.gid);
            }
        }
    }
    for group in group_add {
        let gid = lookup_group(group, &groups)?;
        if !id.additional_gids.contains(&gid) {
            id.additional_gids.push(gid);
        }
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(entrypoint: &[&str], cmd: &[&str]) -> ImageConfig {
        ImageConfig {
            entrypoint: entrypoint.iter().map(|s| (*s).to_owned()).collect(),
            cmd: cmd.iter().map(|s| (*s).to_owned()).collect(),
            ..ImageConfig::default()
        }
    }

    fn s(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn args_merge_with_image() {
        let img = image(&["/entry"], &["default"]);
        let o = RunOptions::default();
        assert_eq!(process_args(&o, &img).unwrap(), s(&["/entry", "default"]));

        let o = RunOptions {
            args: s(&["custom"]),
            ..RunOptions::default()
        };
        assert_eq!(process_args(&o, &img).unwrap(), s(&["/entry", "custom"]));

        let o = RunOptions {
            entrypoint: Some(s(&["/other"])),
            ..RunOptions::default()
        };
        assert_eq!(process_args(&o, &img).unwrap(), s(&["/other"]));

        let o = RunOptions {
            entrypoint: Some(Vec::new()),
            ..RunOptions::default()
        };
        assert!(process_args(&o, &img).is_err());
    }

    #[test]
    fn init_prepends_tini() {
        let o = RunOptions {
            args: s(&["sleep", "1"]),
            init: true,
            ..RunOptions::default()
        };
        let args = process_args(&o, &image(&[], &["sh"])).unwrap();
        assert_eq!(args, s(&[INIT_PATH, "--", "sleep", "1"]));
    }

    #[test]
    fn env_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("env");
        std::fs::write(&file, "# comment\nA=file\nB=file\n").unwrap();
        let img = ImageConfig {
            env: s(&["A=image", "C=image"]),
            ..ImageConfig::default()
        };
        let o = RunOptions {
            env_files: vec![file],
            env: s(&["B=flag", "FROM_HOST", "MISSING"]),
            ..RunOptions::default()
        };
        let lookup = |k: &str| (k == "FROM_HOST").then(|| "host".to_owned());
        let env = process_env(&o, &img, "box", &lookup).unwrap();
        assert!(env.contains(&"A=file".to_owned()));
        assert!(env.contains(&"B=flag".to_owned()));
        assert!(env.contains(&"C=image".to_owned()));
        assert!(env.contains(&"HOSTNAME=box".to_owned()));
        assert!(env.contains(&"FROM_HOST=host".to_owned()));
        assert!(!env.iter().any(|e| e.starts_with("MISSING")));
        assert_eq!(env.iter().filter(|e| e.starts_with("PATH=")).count(), 1);
    }

    #[test]
    fn workdir_and_umask() {
        let o = RunOptions {
            workdir: Some("rel".to_owned()),
            ..RunOptions::default()
        };
        assert!(working_dir(&o, &ImageConfig::default()).is_err());
        let img = ImageConfig {
            working_dir: "/app".to_owned(),
            ..ImageConfig::default()
        };
        assert_eq!(working_dir(&RunOptions::default(), &img).unwrap(), "/app");
        assert_eq!(parse_umask("022").unwrap(), 0o022);
        assert!(parse_umask("999").is_err());
    }

    #[test]
    fn identity_from_image_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("etc")).unwrap();
        std::fs::write(
            dir.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nweb:x:1000:1000::/home/web:/bin/sh\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("etc/group"),
            "root:x:0:\nweb:x:1000:\naudio:x:29:web\nvideo:x:44:\n",
        )
        .unwrap();
        let id = resolve_identity(Some("web"), &s(&["video"]), Some(dir.path())).unwrap();
        assert_eq!((id.uid, id.gid), (1000, 1000));
        assert_eq!(id.additional_gids, vec![29, 44]);

        let id = resolve_identity(Some("1000:0"), &[], Some(dir.path())).unwrap();
        assert_eq!((id.uid, id.gid), (1000, 0));

        let id = resolve_identity(Some("4242"), &[], None).unwrap();
        assert_eq!((id.uid, id.gid), (4242, 0));

        assert!(resolve_identity(Some("nobody"), &[], Some(dir.path())).is_err());
    }
}
