//! SSH command lines for reaching source hosts.

use crate::core::executor::quote;
use crate::core::models::Host;

/// The `ssh ... user@host` prefix, without a remote command.
fn ssh_prefix(ssh: &str, host: &Host) -> String {
    let mut parts = vec![
        quote(ssh),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-p".to_string(),
        host.port.to_string(),
    ];

    if let Some(identity) = &host.identity_file {
        parts.push("-i".to_string());
        parts.push(quote(identity));
    }

    parts.push(quote(&destination(host)));
    parts.join(" ")
}

fn destination(host: &Host) -> String {
    format!("{}@{}", host.user, host.hostname)
}

/// Run `remote` on the host. The remote side gets it as a single argument.
pub fn remote_command(ssh: &str, host: &Host, remote: &str) -> String {
    format!("{} -- {}", ssh_prefix(ssh, host), quote(remote))
}

/// Value for `rsync -e`.
pub fn rsync_shell(ssh: &str, host: &Host) -> String {
    let mut parts = vec![quote(ssh), "-o BatchMode=yes".to_string(), format!("-p {}", host.port)];
    if let Some(identity) = &host.identity_file {
        parts.push(format!("-i {}", quote(identity)));
    }
    parts.join(" ")
}

/// `user@host:path` for rsync.
pub fn rsync_source(host: &Host, path: &str) -> String {
    format!("{}:{}/", destination(host), path.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Host {
        Host {
            id: "h1".into(),
            name: "db".into(),
            hostname: "db.internal".into(),
            port: 2222,
            user: "backup".into(),
            identity_file: Some("/etc/bksched/id_ed25519".into()),
        }
    }

    #[test]
    fn builds_remote_command() {
        let line = remote_command("ssh", &host(), "mysqldump --all-databases");
        assert_eq!(
            line,
            "ssh -o BatchMode=yes -p 2222 -i /etc/bksched/id_ed25519 backup@db.internal -- 'mysqldump --all-databases'"
        );
    }

    #[test]
    fn builds_rsync_source() {
        assert_eq!(rsync_source(&host(), "/srv/borg/"), "backup@db.internal:/srv/borg/");
    }
}
