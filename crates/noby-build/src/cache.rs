//! Layer key computation.
//!
//! A layer key is a SHA-256 over the parent key, the instruction and the
//! environment variables the command mentions (`$NAME` or `${NAME}`). Every
//! field is length-prefixed so adjacent fields can never run into each other.

use std::collections::BTreeSet;

use noby_common::{LayerKey, SCRATCH};
use sha2::{Digest, Sha256};

use crate::env::EnvSet;
use crate::nobyfile::Instruction;

/// Version tag mixed into every key; bump to invalidate all caches.
const KEY_VERSION: &[u8] = b"noby-layer-v1";

/// Compute the key of the layer `instruction` produces on top of `parent`.
///
/// Returns `None` for instructions that do not produce layers.
#[must_use]
pub fn layer_key(
    parent: Option<&LayerKey>,
    instruction: &Instruction,
    env: &EnvSet,
) -> Option<LayerKey> {
    let command = instruction.command()?;

    let mut hasher = Sha256::new();
    update_field(&mut hasher, KEY_VERSION);
    update_field(
        &mut hasher,
        parent.map_or(SCRATCH.as_bytes(), |key| key.as_str().as_bytes()),
    );
    update_field(&mut hasher, instruction.keyword().as_bytes());
    update_field(&mut hasher, command.as_bytes());

    let relevant: Vec<(&str, &str)> = referenced_variables(command)
        .into_iter()
        .filter_map(|name| env.get_key_value(name))
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();

    hasher.update((relevant.len() as u64).to_le_bytes());
    for (name, value) in relevant {
        update_field(&mut hasher, name.as_bytes());
        update_field(&mut hasher, value.as_bytes());
    }

    Some(LayerKey::from_hasher(hasher))
}

/// Names of the variables `command` expands, sorted and deduplicated.
///
/// Recognizes `$NAME` and `${NAME...}`; quoting is not interpreted, so a
/// `$NAME` inside single quotes still counts.
#[must_use]
pub fn referenced_variables(command: &str) -> BTreeSet<&str> {
    let bytes = command.as_bytes();
    let mut names = BTreeSet::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = if bytes.get(i + 1) == Some(&b'{') { i + 2 } else { i + 1 };
        let mut end = start;
        while end < bytes.len()
            && (bytes[end] == b'_'
                || bytes[end].is_ascii_alphabetic()
                || (end > start && bytes[end].is_ascii_digit()))
        {
            end += 1;
        }
        if end > start {
            names.insert(&command[start..end]);
        }
        i = end.max(i + 1);
    }

    names
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
