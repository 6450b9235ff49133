//! nginx virtual host for the application

use std::fmt::Write as _;
use std::path::PathBuf;

use crate::errors::DeployError;

/// Security response headers added to every proxied response
pub const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("X-Frame-Options", "SAMEORIGIN"),
    ("X-Content-Type-Options", "nosniff"),
    ("Referrer-Policy", "strict-origin-when-cross-origin"),
    ("X-XSS-Protection", "1; mode=block"),
];

/// Extensions served with long-lived cache headers
const STATIC_EXTENSIONS: &str = "js|css|png|jpg|jpeg|gif|ico|svg|webp|woff|woff2|ttf|eot|map";

/// Certificate pair for the HTTPS server block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// How public traffic reaches the internal application port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub name: String,
    pub listen_port: u16,
    pub server_names: Vec<String>,
    pub upstream_port: u16,
    pub client_max_body_size: String,
    pub access_log: PathBuf,
    pub error_log: PathBuf,
    pub tls: Option<TlsPaths>,
}

fn has_metachar(value: &str) -> bool {
    value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '"' | '\'' | '$' | '#'))
}

impl ProxyRoute {
    /// Reject values that would break out of their directive
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.listen_port == 0 || self.upstream_port == 0 {
            return Err(DeployError::ValidationError(
                "proxy ports must be non-zero".to_string(),
            ));
        }
        if self.server_names.is_empty() {
            return Err(DeployError::ValidationError(
                "at least one server name is required".to_string(),
            ));
        }
        let values = self
            .server_names
            .iter()
            .map(String::as_str)
            .chain([self.name.as_str(), self.client_max_body_size.as_str()]);
        for value in values {
            if value.is_empty() || has_metachar(value) {
                return Err(DeployError::ValidationError(format!(
                    "{:?} is not usable in a proxy route",
                    value
                )));
            }
        }
        for path in [&self.access_log, &self.error_log] {
            if has_metachar(&path.to_string_lossy()) {
                return Err(DeployError::ValidationError(format!(
                    "log path {} is not usable in a proxy route",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    fn write_headers(out: &mut String, indent: &str) {
        for (name, value) in SECURITY_HEADERS {
            let _ = writeln!(out, "{indent}add_header {name} \"{value}\" always;");
        }
    }

    fn write_locations(&self, out: &mut String) {
        let upstream = format!("http://127.0.0.1:{}", self.upstream_port);

        // add_header inside a location drops the server-level ones, so the
        // security headers are repeated here.
        let _ = writeln!(out, "    location ~* \\.(?:{STATIC_EXTENSIONS})$ {{");
        let _ = writeln!(out, "        proxy_pass {upstream};");
        let _ = writeln!(out, "        proxy_set_header Host $host;");
        let _ = writeln!(out, "        expires 1y;");
        let _ = writeln!(out, "        add_header Cache-Control \"public, immutable\";");
        Self::write_headers(out, "        ");
        let _ = writeln!(out, "    }}");
        out.push('\n');

        let _ = writeln!(out, "    location / {{");
        let _ = writeln!(out, "        proxy_pass {upstream};");
        let _ = writeln!(out, "        proxy_http_version 1.1;");
        let _ = writeln!(out, "        proxy_set_header Upgrade $http_upgrade;");
        let _ = writeln!(out, "        proxy_set_header Connection \"upgrade\";");
        let _ = writeln!(out, "        proxy_set_header Host $host;");
        let _ = writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;");
        let _ = writeln!(
            out,
            "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
        );
        let _ = writeln!(out, "        proxy_set_header X-Forwarded-Proto $scheme;");
        let _ = writeln!(out, "        proxy_cache_bypass $http_upgrade;");
        let _ = writeln!(out, "        proxy_read_timeout 60s;");
        let _ = writeln!(out, "    }}");
    }

    fn write_common(&self, out: &mut String) {
        let _ = writeln!(out, "    server_name {};", self.server_names.join(" "));
        let _ = writeln!(out, "    client_max_body_size {};", self.client_max_body_size);
        let _ = writeln!(out, "    access_log {};", self.access_log.display());
        let _ = writeln!(out, "    error_log {};", self.error_log.display());
        out.push('\n');
        Self::write_headers(out, "    ");
        out.push('\n');
    }

    /// nginx configuration text
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Managed by vpsctl for {}; rewritten on deploy.", self.name);
        out.push('\n');

        let _ = writeln!(out, "server {{");
        let _ = writeln!(out, "    listen {};", self.listen_port);
        let _ = writeln!(out, "    listen [::]:{};", self.listen_port);
        self.write_common(&mut out);
        match &self.tls {
            Some(_) => {
                let _ = writeln!(out, "    location /.well-known/acme-challenge/ {{");
                let _ = writeln!(out, "        root /var/www/html;");
                let _ = writeln!(out, "    }}");
                out.push('\n');
                let _ = writeln!(out, "    location / {{");
                let _ = writeln!(out, "        return 301 https://$host$request_uri;");
                let _ = writeln!(out, "    }}");
            }
            None => self.write_locations(&mut out),
        }
        let _ = writeln!(out, "}}");

        if let Some(tls) = &self.tls {
            out.push('\n');
            let _ = writeln!(out, "server {{");
            let _ = writeln!(out, "    listen 443 ssl http2;");
            let _ = writeln!(out, "    listen [::]:443 ssl http2;");
            let _ = writeln!(out, "    ssl_certificate {};", tls.certificate.display());
            let _ = writeln!(out, "    ssl_certificate_key {};", tls.key.display());
            let _ = writeln!(out, "    ssl_protocols TLSv1.2 TLSv1.3;");
            let _ = writeln!(
                out,
                "    add_header Strict-Transport-Security \"max-age=31536000\" always;"
            );
            self.write_common(&mut out);
            self.write_locations(&mut out);
            let _ = writeln!(out, "}}");
        }
        out
    }
}

/// Whether another site's configuration claims the same listener.
///
/// A site conflicts when it listens on `port` and is either the
/// `default_server` there or answers to one of `names`. The catch-all `_`
/// only collides with another catch-all.
pub fn conflicts_with(config: &str, port: u16, names: &[String]) -> bool {
    let mut listens_on_port = false;
    let mut default_server = false;
    let mut server_names: Vec<&str> = Vec::new();

    for line in config.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        let line = line.trim_end_matches(';');
        let mut words = line.split_whitespace();
        match words.next() {
            Some("listen") => {
                let mut rest = words;
                let Some(addr) = rest.next() else { continue };
                let addr_port = addr.rsplit(':').next().unwrap_or(addr);
                if addr_port.parse::<u16>().ok() == Some(port) {
                    listens_on_port = true;
                    if rest.any(|w| w == "default_server" || w == "default") {
                        default_server = true;
                    }
                }
            }
            Some("server_name") => server_names.extend(words),
            _ => {}
        }
    }

    if !listens_on_port {
        return false;
    }
    default_server || names.iter().any(|name| server_names.contains(&name.as_str()))
}
