use std::net::UdpSocket;

/// Devine l'adresse IP locale de la machine.
///
/// Un socket UDP est « connecté » vers un résolveur public pour que le système
/// choisisse l'interface de sortie ; aucun paquet n'est émis. Sert à afficher
/// l'URL du poste d'écoute au démarrage (`http://<ip>:<port>`).
///
/// Retourne `"127.0.0.1"` si aucune interface n'a pu être déterminée.
pub fn guess_local_ip() -> String {
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
        return "127.0.0.1".to_string();
    };
    if socket.connect("8.8.8.8:80").is_err() {
        return "127.0.0.1".to_string();
    }
    socket
        .local_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Construit l'URL d'écoute annoncée aux clients du réseau local.
pub fn listen_url(port: u16) -> String {
    format!("http://{}:{}", guess_local_ip(), port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn test_guess_local_ip_is_valid_ipv4() {
        let ip = guess_local_ip();
        let parsed = ip.parse::<IpAddr>().expect("valid IP");
        assert!(parsed.is_ipv4(), "Should return an IPv4 address");
    }

    #[test]
    fn test_listen_url_format() {
        let url = listen_url(8765);
        assert!(url.starts_with("http://"));
        assert!(url.ends_with(":8765"));
    }
}
