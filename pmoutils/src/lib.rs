//! Petits utilitaires système partagés par les crates PMORadio.
//!
//! - [`guess_local_ip`] / [`listen_url`] : adresse annoncée au démarrage
//! - [`free_space_mb`] : garde-fou d'espace disque avant chaque génération
//! - [`get_os_string`] : identification de la plate-forme dans les rapports d'erreur
mod disk;
mod ip_utils;

pub use disk::free_space_mb;
pub use ip_utils::{guess_local_ip, listen_url};

/// Retourne une chaîne décrivant le système d'exploitation et sa version.
///
/// # Format
/// - macOS: "Macos/15.1"
/// - Linux: "Ubuntu/22.04"
/// - Autre: "{OS}/Unknown"
pub fn get_os_string() -> String {
    let info = os_info::get();
    let os_type = format!("{:?}", info.os_type());

    match info.version() {
        os_info::Version::Unknown => format!("{}/Unknown", os_type),
        version => format!("{}/{}", os_type, version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_string_has_separator() {
        let os = get_os_string();
        assert!(os.contains('/'));
    }
}
