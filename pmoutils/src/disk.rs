//! Espace disque disponible pour les répertoires gérés.

use std::path::{Path, PathBuf};
use sysinfo::Disks;

/// Retourne l'espace libre (en Mo) du volume qui contient `path`.
///
/// Le volume retenu est celui dont le point de montage est le plus long
/// préfixe du chemin canonique. Si `path` n'existe pas encore, on remonte
/// jusqu'au premier ancêtre existant.
///
/// Retourne `None` si aucun volume ne correspond (système sans information
/// disque, conteneur exotique…) : l'appelant décide alors quoi faire.
pub fn free_space_mb(path: &Path) -> Option<f64> {
    let resolved = existing_ancestor(path)?;
    let disks = Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .filter(|disk| resolved.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space() as f64 / (1024.0 * 1024.0))
}

fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if let Ok(canonical) = candidate.canonicalize() {
            return Some(canonical);
        }
        current = candidate.parent();
    }
    None
}
