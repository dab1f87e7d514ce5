//! Generates the entrypoint script that runs as root inside the container.
//!
//! The script creates a user and group matching the host identity, chowns
//! the volumes that asked for it, runs post-start commands, and execs the
//! privilege-drop helper with the user command. It must work with both GNU
//! shadow-utils (Debian/RHEL families) and BusyBox (Alpine), so every
//! identity operation dispatches on `command -v`.

use std::io;

use crate::spec::{ContainerSpec, EnvEntry, GOSU_MOUNT_PATH};

/// Strict POSIX single-quoting. The output is always quoted, even when the
/// input has no special characters, so generated lines have a uniform shape
/// and nothing config-derived is ever interpolated bare.
pub fn sh_quote(s: &str) -> String {
    if s.is_empty() {
        return String::from("''");
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str(r"'\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

pub fn write_entrypoint<W: io::Write>(w: &mut W, spec: &ContainerSpec) -> io::Result<()> {
    // Quote everything up front; only these locals reach the script text.
    let user_name = sh_quote(&spec.user_name);
    let group_name = sh_quote(&spec.group_name);
    let home = sh_quote(&spec.user_home);
    let uid = spec.user_id;
    let gid = spec.group_id;

    writeln!(w, "#!/bin/sh")?;
    writeln!(w, "# Generated by ctenv. Runs as root, then drops to the host user.")?;
    writeln!(w, "set -eu")?;
    writeln!(w, "unset IFS")?;
    writeln!(w)?;

    // Reuse an existing group with the right gid; create one otherwise.
    writeln!(
        w,
        "group_name=\"$(awk -F: -v gid={gid} '$3 == gid {{ print $1; exit }}' /etc/group)\""
    )?;
    writeln!(w, "if [ -z \"$group_name\" ]; then")?;
    writeln!(w, "    group_name={group_name}")?;
    writeln!(w, "    if command -v groupadd >/dev/null 2>&1; then")?;
    writeln!(w, "        groupadd -g {gid} \"$group_name\"")?;
    writeln!(w, "    else")?;
    writeln!(w, "        addgroup -g {gid} \"$group_name\"")?;
    writeln!(w, "    fi")?;
    writeln!(w, "fi")?;
    writeln!(w)?;

    writeln!(
        w,
        "user_name=\"$(awk -F: -v uid={uid} '$3 == uid {{ print $1; exit }}' /etc/passwd)\""
    )?;
    writeln!(w, "if [ -z \"$user_name\" ]; then")?;
    writeln!(w, "    user_name={user_name}")?;
    writeln!(w, "    if command -v useradd >/dev/null 2>&1; then")?;
    writeln!(
        w,
        "        useradd -u {uid} -g {gid} -d {home} -M -s /bin/sh \"$user_name\""
    )?;
    writeln!(w, "    else")?;
    writeln!(
        w,
        "        adduser -D -H -u {uid} -G \"$group_name\" -h {home} \"$user_name\""
    )?;
    writeln!(w, "    fi")?;
    writeln!(w, "fi")?;
    writeln!(w)?;

    writeln!(w, "mkdir -p {home}")?;
    writeln!(w, "chown {uid}:{gid} {home}")?;

    if spec.sudo {
        writeln!(w)?;
        writeln!(w, "if ! command -v sudo >/dev/null 2>&1; then")?;
        writeln!(w, "    if command -v apt-get >/dev/null 2>&1; then")?;
        writeln!(w, "        apt-get update -qq && apt-get install -y -qq sudo")?;
        writeln!(w, "    elif command -v dnf >/dev/null 2>&1; then")?;
        writeln!(w, "        dnf install -y -q sudo")?;
        writeln!(w, "    elif command -v yum >/dev/null 2>&1; then")?;
        writeln!(w, "        yum install -y -q sudo")?;
        writeln!(w, "    elif command -v apk >/dev/null 2>&1; then")?;
        writeln!(w, "        apk add --quiet sudo")?;
        writeln!(w, "    else")?;
        writeln!(w, "        echo 'ctenv: no package manager found to install sudo' >&2")?;
        writeln!(w, "        exit 1")?;
        writeln!(w, "    fi")?;
        writeln!(w, "fi")?;
        writeln!(w, "mkdir -p /etc/sudoers.d")?;
        writeln!(
            w,
            "echo \"$user_name ALL=(ALL) NOPASSWD:ALL\" > /etc/sudoers.d/ctenv"
        )?;
    }

    let chowns: Vec<_> = spec.volumes.iter().filter(|v| v.chown()).collect();
    if !chowns.is_empty() {
        writeln!(w)?;
        for volume in chowns {
            // ContainerPath guarantees the target is absolute.
            writeln!(
                w,
                "chown -R {uid}:{gid} {}",
                sh_quote(&volume.container.display().to_string())
            )?;
        }
    }

    if !spec.post_start_commands.is_empty() {
        writeln!(w)?;
        // set -e aborts the container on the first failing command.
        for command in &spec.post_start_commands {
            writeln!(w, "/bin/sh -c {}", sh_quote(command))?;
        }
    }

    writeln!(w)?;
    writeln!(w, "export HOME={home}")?;
    writeln!(w, "export USER=\"$user_name\"")?;
    writeln!(w, "export LOGNAME=\"$user_name\"")?;
    writeln!(w, "export SHELL=/bin/sh")?;

    // The entrypoint is not an interactive shell, so a PS1 passed with
    // --env does not survive to the final shell on its own. Export it
    // explicitly, and keep bash from letting rc files rewrite it.
    writeln!(w, "norc=''")?;
    if spec.env_names_ps1() {
        match spec.env.iter().find(|e| e.name() == "PS1") {
            Some(EnvEntry::Set { value, .. }) => {
                writeln!(w, "export PS1={}", sh_quote(value))?;
            }
            _ => {
                writeln!(w, "export PS1=\"${{PS1-}}\"")?;
            }
        }
        writeln!(
            w,
            "if /bin/sh --version 2>/dev/null | grep -q bash; then norc='--norc'; fi"
        )?;
    }

    let interactive = if spec.tty { "-i " } else { "" };
    writeln!(
        w,
        "exec {gosu} \"$user_name\" /bin/sh $norc {interactive}-c {command}",
        gosu = sh_quote(GOSU_MOUNT_PATH),
        command = sh_quote(&spec.command),
    )?;

    Ok(())
}

/// Renders the script to a string; the driver writes it to a temp file.
pub fn render_entrypoint(spec: &ContainerSpec) -> String {
    let mut buf = Vec::new();
    write_entrypoint(&mut buf, spec).expect("writing to a Vec cannot fail");
    String::from_utf8(buf).expect("generated script is valid UTF-8")
}
