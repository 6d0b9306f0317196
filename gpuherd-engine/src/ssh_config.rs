use std::io;
use std::path::{Path, PathBuf};

use gpuherd_common::Instance;

pub const MARKER_BEGIN: &str = "# BEGIN GPUHERD MANAGED";
pub const MARKER_END: &str = "# END GPUHERD MANAGED";

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub user: String,
    pub keys_dir: PathBuf,
}

/// SSH host alias for an instance name. The name is the user's handle on the
/// instance, so keep it recognizable; just make it config-safe.
pub fn host_alias(name: &str) -> String {
    name.trim().replace(' ', "-").to_lowercase()
}

/// Find the private key matching a provider key name in the configured key
/// directory. Entries without a resolvable key simply omit IdentityFile.
pub fn resolve_identity_file(keys_dir: &Path, key_name: &str) -> Option<PathBuf> {
    let candidates = [
        keys_dir.join(key_name),
        keys_dir.join(format!("{}.pem", key_name)),
    ];
    candidates.into_iter().find(|p| p.is_file())
}

/// Render the managed block for the given active instances. Deterministic:
/// instances are ordered by alias and the block carries no timestamps, so an
/// unchanged fleet renders byte-identical output.
pub fn render_managed_block(instances: &[Instance], settings: &SshSettings) -> String {
    let mut entries: Vec<&Instance> = instances
        .iter()
        .filter(|inst| inst.ip.as_deref().is_some_and(|ip| !ip.trim().is_empty()))
        .collect();
    entries.sort_by_key(|inst| host_alias(&inst.name));

    let mut block = String::new();
    block.push_str(MARKER_BEGIN);
    block.push('\n');

    for inst in entries {
        let ip = inst.ip.as_deref().unwrap_or_default();
        block.push_str(&format!("Host {}\n", host_alias(&inst.name)));
        block.push_str(&format!("    HostName {}\n", ip));
        block.push_str(&format!("    User {}\n", settings.user));
        if let Some(identity) = inst
            .ssh_key_name
            .as_deref()
            .and_then(|key| resolve_identity_file(&settings.keys_dir, key))
        {
            block.push_str(&format!("    IdentityFile {}\n", identity.display()));
        }
        block.push_str("    StrictHostKeyChecking no\n");
        block.push_str("    UserKnownHostsFile /dev/null\n");
        block.push('\n');
    }

    block.push_str(MARKER_END);
    block.push('\n');
    block
}

/// Splice the managed block into the config file, preserving everything
/// outside the markers byte-for-byte. Returns whether the file changed.
pub fn sync_managed_block(path: &Path, block: &str) -> io::Result<bool> {
    let existing = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let updated = splice_block(&existing, block);
    if updated == existing {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, &updated)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(true)
}

fn splice_block(existing: &str, block: &str) -> String {
    match existing.find(MARKER_BEGIN) {
        Some(begin) => {
            // Replace everything from BEGIN through END (or to EOF when the
            // end marker was lost) and keep the rest untouched.
            let after = match existing[begin..].find(MARKER_END) {
                Some(rel_end) => {
                    let mut end = begin + rel_end + MARKER_END.len();
                    if existing[end..].starts_with('\n') {
                        end += 1;
                    }
                    &existing[end..]
                }
                None => "",
            };
            format!("{}{}{}", &existing[..begin], block, after)
        }
        None if existing.trim().is_empty() => block.to_string(),
        None => format!("{}\n\n{}", existing.trim_end(), block),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn instance(id: &str, name: &str, ip: &str, key: Option<&str>) -> Instance {
        Instance {
            id: id.into(),
            account: "default".into(),
            name: name.into(),
            ip: if ip.is_empty() { None } else { Some(ip.into()) },
            region: "us-west-1".into(),
            instance_type: "gpu_1x_a10".into(),
            gpu_count: 1,
            hourly_cost_cents: 75,
            ssh_key_name: key.map(Into::into),
            launched_at: 0,
            first_seen: 0,
            last_seen: 0,
            cost_accrued_cents: 0,
            ended_at: None,
        }
    }

    fn settings(dir: &TempDir) -> SshSettings {
        SshSettings {
            user: "ubuntu".into(),
            keys_dir: dir.path().to_path_buf(),
        }
    }

    #[test]
    fn rewrite_is_byte_identical_for_unchanged_fleet() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config");
        let settings = settings(&dir);

        let fleet = vec![
            instance("i-1", "Trainer One", "10.0.0.1", None),
            instance("i-2", "batch", "10.0.0.2", None),
        ];

        let block = render_managed_block(&fleet, &settings);
        assert!(sync_managed_block(&config_path, &block).unwrap());
        let first = std::fs::read_to_string(&config_path).unwrap();

        let block_again = render_managed_block(&fleet, &settings);
        assert!(!sync_managed_block(&config_path, &block_again).unwrap());
        let second = std::fs::read_to_string(&config_path).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn user_content_outside_markers_survives() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config");
        let settings = settings(&dir);

        let user_head = "Host bastion\n    HostName bastion.example.com\n    User admin\n";
        std::fs::write(&config_path, user_head).unwrap();

        let fleet = vec![instance("i-1", "trainer", "10.0.0.1", None)];
        let block = render_managed_block(&fleet, &settings);
        sync_managed_block(&config_path, &block).unwrap();

        let content = std::fs::read_to_string(&config_path).unwrap();
        assert!(content.starts_with("Host bastion"));
        assert!(content.contains("Host trainer"));

        // A second fleet state rewrites only the managed region.
        let fleet = vec![instance("i-2", "batch", "10.0.0.2", None)];
        let block = render_managed_block(&fleet, &settings);
        sync_managed_block(&config_path, &block).unwrap();

        let content = std::fs::read_to_string(&config_path).unwrap();
        assert!(content.starts_with("Host bastion"));
        assert!(content.contains("Host batch"));
        assert!(!content.contains("Host trainer"));
        assert_eq!(content.matches(MARKER_BEGIN).count(), 1);
    }

    #[test]
    fn dropped_instances_leave_the_block() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config");
        let settings = settings(&dir);

        let fleet = vec![
            instance("i-1", "trainer", "10.0.0.1", None),
            instance("i-2", "batch", "10.0.0.2", None),
        ];
        sync_managed_block(&config_path, &render_managed_block(&fleet, &settings)).unwrap();

        let fleet = vec![instance("i-1", "trainer", "10.0.0.1", None)];
        sync_managed_block(&config_path, &render_managed_block(&fleet, &settings)).unwrap();

        let content = std::fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("Host trainer"));
        assert!(!content.contains("Host batch"));
    }

    #[test]
    fn identity_file_resolved_from_key_directory() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        std::fs::write(dir.path().join("herd-key.pem"), "key material").unwrap();

        let fleet = vec![
            instance("i-1", "with-key", "10.0.0.1", Some("herd-key")),
            instance("i-2", "without-key", "10.0.0.2", Some("unknown-key")),
        ];
        let block = render_managed_block(&fleet, &settings);

        let expected = format!("IdentityFile {}", dir.path().join("herd-key.pem").display());
        assert!(block.contains(&expected));
        // Only the resolvable key produces an IdentityFile line.
        assert_eq!(block.matches("IdentityFile").count(), 1);
    }

    #[test]
    fn instances_without_ip_are_skipped() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let fleet = vec![
            instance("i-1", "booting", "", None),
            instance("i-2", "ready", "10.0.0.2", None),
        ];
        let block = render_managed_block(&fleet, &settings);
        assert!(!block.contains("booting"));
        assert!(block.contains("Host ready"));
    }
}
