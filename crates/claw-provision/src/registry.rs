//! Secret descriptor registry.
//!
//! [`build_descriptors`] normalizes every secret source into one validated,
//! deterministically ordered descriptor list. It never touches the
//! filesystem; discovery happens beforehand in [`crate::discovery`].
//!
//! ## Merge precedence
//!
//! When the same name comes from several sources the highest-precedence one
//! is kept: explicit config > role/user entries > manifest > discovered. The
//! loser is dropped with a `debug` log line; this is not an error. A
//! discovered file whose ciphertext is already the source of a kept
//! descriptor is dropped the same way.
//!
//! ## Identity graph
//!
//! Explicit entries may omit `phase`; it is derived as one more than the
//! producer's phase. Derivation walks the identity references and rejects
//! cycles. After derivation every descriptor must reference a strictly
//! earlier phase, master-identity descriptors must be phase 1, and phases
//! must be dense.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use tracing::debug;

use crate::config::SecretEntry;
use crate::discovery::Discovered;
use crate::error::{ProvisionError, Result};
use crate::manifest::Manifest;
use crate::types::{
    validate_component, FileMode, IdentityRef, Layout, Origin, SecretDescriptor, UnitAction,
};

/// Name of the phase-1 key descriptor for `role`.
#[must_use]
pub fn role_key_name(role: &str) -> String {
    format!("role-key-{role}")
}

/// Name of the phase-1 deployment key descriptor for `user`.
#[must_use]
pub fn user_key_name(user: &str) -> String {
    format!("user-key-{user}")
}

/// Name of the phase-2 secondary-manifest expansion unit for `user`.
#[must_use]
pub fn user_secrets_name(user: &str) -> String {
    format!("user-secrets-{user}")
}

/// A descriptor whose identity and phase are not yet resolved.
#[derive(Debug, Clone)]
struct Candidate {
    descriptor: SecretDescriptor,
    /// Producer name, `None` for master.
    producer: Option<String>,
    /// Pinned phase, `None` to derive.
    phase: Option<u32>,
}

impl Candidate {
    fn master(descriptor: SecretDescriptor) -> Self {
        Self {
            descriptor,
            producer: None,
            phase: Some(1),
        }
    }

    fn produced_by(descriptor: SecretDescriptor, producer: String) -> Self {
        Self {
            descriptor,
            producer: Some(producer),
            phase: None,
        }
    }
}

/// Builds the validated descriptor set for a host.
///
/// Output is sorted by phase, then name.
///
/// # Errors
///
/// Returns a configuration error if names are unsafe or collide within one
/// source, an identity reference is unknown or cyclic, two descriptors share
/// a target, or phases are not dense.
pub fn build_descriptors(
    explicit: &BTreeMap<String, SecretEntry>,
    manifest: &Manifest,
    discovered: &Discovered,
    roles: &[String],
    users: &[String],
    layout: &Layout,
) -> Result<Vec<SecretDescriptor>> {
    let mut candidates = Vec::new();

    for (name, entry) in explicit {
        let mut descriptor =
            SecretDescriptor::new(name, &entry.source, &entry.target, layout.master())
                .with_owner(&entry.owner)
                .with_mode(entry.mode);
        descriptor.group.clone_from(&entry.group);
        candidates.push(Candidate {
            descriptor,
            producer: entry.producer().map(str::to_string),
            phase: entry.phase,
        });
    }

    for role in roles {
        candidates.extend(role_candidates(role, discovered, layout));
    }

    for user in users {
        candidates.extend(user_candidates(user, layout));
    }

    candidates.extend(manifest.descriptors(layout).into_iter().map(Candidate::master));

    candidates.extend(discovered.host.iter().map(|file| {
        Candidate::master(
            SecretDescriptor::new(
                &file.name,
                &file.path,
                layout.runtime_root.join(&file.name),
                layout.master(),
            )
            .with_origin(Origin::Discovered),
        )
    }));

    let merged = merge(candidates)?;
    let phases = derive_phases(&merged)?;
    let descriptors = resolve(merged, &phases)?;
    validate(&descriptors)?;
    Ok(descriptors)
}

fn role_candidates(role: &str, discovered: &Discovered, layout: &Layout) -> Vec<Candidate> {
    let key_name = role_key_name(role);
    let mut out = vec![Candidate::master(
        SecretDescriptor::new(
            &key_name,
            layout.role_key_source(role),
            layout.role_key_target(role),
            layout.master(),
        )
        .with_origin(Origin::Role(role.to_string())),
    )];

    for file in discovered.roles.get(role).into_iter().flatten() {
        out.push(Candidate::produced_by(
            SecretDescriptor::new(
                format!("role-{role}-{}", file.name),
                &file.path,
                layout.role_dir(role).join(&file.name),
                layout.master(),
            )
            .with_origin(Origin::Role(role.to_string())),
            key_name.clone(),
        ));
    }
    out
}

fn user_candidates(user: &str, layout: &Layout) -> [Candidate; 2] {
    let key_name = user_key_name(user);
    let key = SecretDescriptor::new(
        &key_name,
        layout.user_key_source(user),
        layout.user_key_target(user),
        layout.master(),
    )
    .with_owner(user)
    .with_origin(Origin::User(user.to_string()));

    let expansion = SecretDescriptor::new(
        user_secrets_name(user),
        layout.user_manifest_source(user),
        layout.user_dir(user),
        layout.master(),
    )
    .with_owner(user)
    .with_mode(FileMode::OWNER_READ)
    .with_origin(Origin::User(user.to_string()))
    .with_action(UnitAction::ExpandUserManifest {
        user: user.to_string(),
        secrets_dir: layout.user_secrets_dir(user),
    });

    [
        Candidate::master(key),
        Candidate::produced_by(expansion, key_name),
    ]
}

/// Resolves name collisions by origin precedence.
fn merge(candidates: Vec<Candidate>) -> Result<BTreeMap<String, Candidate>> {
    let mut merged: BTreeMap<String, Candidate> = BTreeMap::new();

    for candidate in candidates {
        let name = candidate.descriptor.name.clone();
        validate_component("secret name", &name)?;

        match merged.get(&name) {
            None => {
                merged.insert(name, candidate);
            }
            Some(existing) => {
                let kept = existing.descriptor.origin.precedence();
                let incoming = candidate.descriptor.origin.precedence();
                if kept == incoming {
                    return Err(ProvisionError::DuplicateName(format!(
                        "'{name}' is declared twice by {}",
                        candidate.descriptor.origin
                    )));
                }
                if incoming > kept {
                    debug!(
                        name = %name,
                        kept = %candidate.descriptor.origin,
                        dropped = %existing.descriptor.origin,
                        "dropping lower-precedence duplicate"
                    );
                    merged.insert(name, candidate);
                } else {
                    debug!(
                        name = %name,
                        kept = %existing.descriptor.origin,
                        dropped = %candidate.descriptor.origin,
                        "dropping lower-precedence duplicate"
                    );
                }
            }
        }
    }

    let claimed: HashSet<PathBuf> = merged
        .values()
        .filter(|c| c.descriptor.origin != Origin::Discovered)
        .map(|c| c.descriptor.source.clone())
        .collect();
    merged.retain(|name, c| {
        let shadowed =
            c.descriptor.origin == Origin::Discovered && claimed.contains(&c.descriptor.source);
        if shadowed {
            debug!(
                name = %name,
                source = %c.descriptor.source.display(),
                "dropping discovered file already claimed"
            );
        }
        !shadowed
    });

    Ok(merged)
}

/// Derives every candidate's phase, walking identity references.
fn derive_phases(merged: &BTreeMap<String, Candidate>) -> Result<HashMap<String, u32>> {
    let mut phases = HashMap::with_capacity(merged.len());
    for name in merged.keys() {
        let mut path = Vec::new();
        phase_of(name, merged, &mut phases, &mut path)?;
    }
    Ok(phases)
}

fn phase_of(
    name: &str,
    merged: &BTreeMap<String, Candidate>,
    phases: &mut HashMap<String, u32>,
    path: &mut Vec<String>,
) -> Result<u32> {
    if let Some(phase) = phases.get(name) {
        return Ok(*phase);
    }
    if let Some(pos) = path.iter().position(|n| n == name) {
        let mut cycle = path[pos..].to_vec();
        cycle.push(name.to_string());
        return Err(ProvisionError::CyclicIdentity(cycle.join(" -> ")));
    }

    let candidate = merged
        .get(name)
        .ok_or_else(|| ProvisionError::Internal(format!("unknown candidate '{name}'")))?;

    path.push(name.to_string());
    let producer_phase = match &candidate.producer {
        Some(producer) => {
            if !merged.contains_key(producer) {
                return Err(ProvisionError::UnknownIdentity {
                    name: name.to_string(),
                    identity: producer.clone(),
                });
            }
            Some(phase_of(producer, merged, phases, path)?)
        }
        None => None,
    };
    path.pop();

    let phase = match (candidate.phase, producer_phase) {
        (Some(pinned), _) => pinned,
        (None, Some(p)) => p + 1,
        (None, None) => 1,
    };
    phases.insert(name.to_string(), phase);
    Ok(phase)
}

/// Attaches resolved phases and identity paths.
fn resolve(
    merged: BTreeMap<String, Candidate>,
    phases: &HashMap<String, u32>,
) -> Result<Vec<SecretDescriptor>> {
    let targets: HashMap<String, PathBuf> = merged
        .iter()
        .map(|(name, c)| (name.clone(), c.descriptor.target.clone()))
        .collect();

    let mut out = Vec::with_capacity(merged.len());
    for (name, candidate) in merged {
        let mut descriptor = candidate.descriptor;
        descriptor.phase = phases.get(&name).copied().unwrap_or(1);
        if let Some(producer) = candidate.producer {
            let path = targets
                .get(&producer)
                .cloned()
                .ok_or_else(|| ProvisionError::UnknownIdentity {
                    name: name.clone(),
                    identity: producer.clone(),
                })?;
            descriptor.identity = IdentityRef::produced(producer, path);
        }
        out.push(descriptor);
    }

    out.sort_by(|a, b| a.phase.cmp(&b.phase).then_with(|| a.name.cmp(&b.name)));
    Ok(out)
}

/// Checks phase ordering, density and target uniqueness.
fn validate(descriptors: &[SecretDescriptor]) -> Result<()> {
    let phase_by_name: HashMap<&str, u32> = descriptors
        .iter()
        .map(|d| (d.name.as_str(), d.phase))
        .collect();

    let mut targets = HashSet::new();
    for d in descriptors {
        if d.phase == 0 {
            return Err(ProvisionError::InvalidPhase(format!(
                "secret '{}' has phase 0; phases start at 1",
                d.name
            )));
        }
        match d.identity.producer() {
            None if d.phase != 1 => {
                return Err(ProvisionError::InvalidPhase(format!(
                    "secret '{}' uses the master identity but is in phase {}",
                    d.name, d.phase
                )));
            }
            Some(producer) => {
                let producer_phase = phase_by_name.get(producer).copied().unwrap_or(0);
                if producer_phase >= d.phase {
                    return Err(ProvisionError::InvalidPhase(format!(
                        "secret '{}' (phase {}) depends on '{producer}' (phase {producer_phase})",
                        d.name, d.phase
                    )));
                }
            }
            None => {}
        }
        if !d.is_expansion() && !targets.insert(d.target.clone()) {
            return Err(ProvisionError::Config(format!(
                "target '{}' is claimed by more than one secret",
                d.target.display()
            )));
        }
    }

    let present: BTreeSet<u32> = descriptors.iter().map(|d| d.phase).collect();
    for (expected, phase) in (1u32..).zip(&present) {
        if *phase != expected {
            return Err(ProvisionError::InvalidPhase(format!(
                "phase {expected} is empty but phase {phase} is used"
            )));
        }
    }

    Ok(())
}
