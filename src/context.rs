//! A one-shot snapshot of the invoking host environment: user identity,
//! working directory, project directory, pid, and tty state. Captured once
//! per invocation; everything downstream reads from it and nothing writes
//! back.

use std::ffi::CStr;

use anyhow::{anyhow, Context, Result};

use crate::config;
use crate::newtype::HostPath;
use crate::template::Vars;

#[derive(Clone, Debug)]
pub struct RuntimeContext {
    pub user_name: String,
    pub user_id: u32,
    pub user_home: HostPath,
    pub group_name: String,
    pub group_id: u32,
    pub cwd: HostPath,
    pub project_dir: HostPath,
    pub pid: u32,
    pub tty: bool,
}

impl RuntimeContext {
    /// Captures the snapshot. An explicit `project_dir` wins; otherwise the
    /// directory of the discovered project config file; otherwise the
    /// current directory itself.
    pub fn capture(explicit_project_dir: Option<HostPath>) -> Result<Self> {
        let cwd = std::env::current_dir().context("failed to get current directory")?;
        let cwd = HostPath::try_from(cwd)?;

        let user_id = rustix::process::getuid().as_raw();
        let group_id = rustix::process::getgid().as_raw();
        let pid = rustix::process::getpid().as_raw_nonzero().get() as u32;

        let passwd = lookup_passwd(user_id);
        let user_name = match &passwd {
            Some((name, _)) => name.clone(),
            None => std::env::var("USER").map_err(|_| {
                anyhow!("cannot determine user name: uid {user_id} has no passwd entry and $USER is unset")
            })?,
        };
        let user_home = match std::env::var("HOME") {
            Ok(home) => HostPath::try_from(home).context("invalid $HOME")?,
            Err(_) => match passwd {
                Some((_, dir)) => HostPath::try_from(dir)
                    .with_context(|| format!("invalid home directory in passwd entry for {user_name}"))?,
                None => return Err(anyhow!(
                    "cannot determine home directory: $HOME is unset and uid {user_id} has no passwd entry"
                )),
            },
        };
        let group_name = lookup_group(group_id).unwrap_or_else(|| user_name.clone());

        let project_dir = match explicit_project_dir {
            Some(dir) => dir,
            None => config::find_project_config(&cwd, &user_home)
                .and_then(|path| path.parent())
                .unwrap_or_else(|| cwd.clone()),
        };

        Ok(Self {
            user_name,
            user_id,
            user_home,
            group_name,
            group_id,
            cwd,
            project_dir,
            pid,
            tty: atty::is(atty::Stream::Stdin),
        })
    }

    /// The substitution namespace drawn from this context. `project_dir`
    /// is passed in because a config layer may have overridden the
    /// detected one.
    pub fn vars(&self, project_dir: &HostPath) -> Vars {
        let mut vars = Vars::new();
        vars.set("user_name", self.user_name.clone());
        vars.set("user_id", self.user_id.to_string());
        vars.set("user_home", self.user_home.display().to_string());
        vars.set("group_name", self.group_name.clone());
        vars.set("group_id", self.group_id.to_string());
        vars.set("project_dir", project_dir.display().to_string());
        vars.set("pid", self.pid.to_string());
        vars
    }
}

fn lookup_passwd(uid: u32) -> Option<(String, String)> {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    loop {
        let rc = unsafe {
            libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        break;
    }
    let name = unsafe { CStr::from_ptr(pwd.pw_name) }.to_str().ok()?;
    let dir = unsafe { CStr::from_ptr(pwd.pw_dir) }.to_str().ok()?;
    Some((name.to_owned(), dir.to_owned()))
}

fn lookup_group(gid: u32) -> Option<String> {
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 1024];
    let mut result: *mut libc::group = std::ptr::null_mut();
    loop {
        let rc = unsafe {
            libc::getgrgid_r(gid, &mut grp, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        break;
    }
    let name = unsafe { CStr::from_ptr(grp.gr_name) }.to_str().ok()?;
    Some(name.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_reflects_the_process() {
        let ctx = RuntimeContext::capture(None).unwrap();
        assert_eq!(ctx.user_id, rustix::process::getuid().as_raw());
        assert_eq!(ctx.group_id, rustix::process::getgid().as_raw());
        assert!(ctx.pid > 0);
        assert!(ctx.cwd.as_path().is_absolute());
    }

    #[test]
    fn explicit_project_dir_wins() {
        let dir = HostPath::try_from("/somewhere/else").unwrap();
        let ctx = RuntimeContext::capture(Some(dir.clone())).unwrap();
        assert_eq!(ctx.project_dir, dir);
    }

    #[test]
    fn vars_cover_the_documented_namespace() {
        let ctx = RuntimeContext::capture(None).unwrap();
        let project = HostPath::try_from("/proj").unwrap();
        let vars = ctx.vars(&project);
        let expanded =
            crate::template::expand("test", "${user_id}:${group_id}:${project_dir}:${pid}", &vars)
                .unwrap();
        assert_eq!(
            expanded,
            format!("{}:{}:/proj:{}", ctx.user_id, ctx.group_id, ctx.pid)
        );
    }
}
