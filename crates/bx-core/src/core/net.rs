use std::fs::File;
use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::blocking::Client;
use reqwest::header::HeaderValue;
use reqwest::{NoProxy, Proxy};
use tracing::debug;
use url::Url;

use crate::core::config::{CacheSettings, EnvSnapshot};

const USER_AGENT: &str = concat!("bx/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) fn keep_proxies(snapshot: &EnvSnapshot) -> bool {
    match snapshot.var("BX_KEEP_PROXIES") {
        Some(raw) => {
            let value = raw.trim().to_ascii_lowercase();
            !matches!(value.as_str(), "" | "0" | "false" | "no" | "off")
        }
        None => {
            const PROXY_KEYS: &[&str] = &[
                "HTTP_PROXY",
                "http_proxy",
                "HTTPS_PROXY",
                "https_proxy",
                "ALL_PROXY",
                "all_proxy",
                "NO_PROXY",
                "no_proxy",
            ];
            PROXY_KEYS
                .iter()
                .any(|key| snapshot.non_empty(key).is_some())
        }
    }
}

/// First configured proxy, `https` variables before `http` ones.
pub(crate) fn proxy_url(snapshot: &EnvSnapshot) -> Option<String> {
    if !keep_proxies(snapshot) {
        return None;
    }
    [
        "HTTPS_PROXY",
        "https_proxy",
        "HTTP_PROXY",
        "http_proxy",
        "ALL_PROXY",
        "all_proxy",
    ]
    .iter()
    .find_map(|key| snapshot.non_empty(key))
    .map(|value| value.trim().to_string())
}

/// `Proxy-Authorization` value for a `user:password` credential.
pub(crate) fn proxy_authorization(credential: &str) -> String {
    format!("Basic {}", STANDARD.encode(credential.as_bytes()))
}

/// The configured proxy carrying the credential. Credentials go to the proxy
/// only: on forwarded requests for http and in the CONNECT for https.
fn authenticated_proxy(settings: &CacheSettings) -> Result<Option<Proxy>> {
    let (Some(url), Some(credential)) = (settings.proxy_url.as_deref(), settings.proxy_auth.as_deref())
    else {
        return Ok(None);
    };
    let mut header = HeaderValue::from_str(&proxy_authorization(credential))
        .context("BX_PROXY_AUTH is not a valid header value")?;
    header.set_sensitive(true);
    let proxy = Proxy::all(url)
        .with_context(|| format!("invalid proxy {url}"))?
        .custom_http_auth(header)
        .no_proxy(NoProxy::from_env());
    Ok(Some(proxy))
}

fn http_client(settings: &CacheSettings) -> Result<Client> {
    let builder = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT);
    let builder = if !settings.keep_proxies {
        builder.no_proxy()
    } else if let Some(proxy) = authenticated_proxy(settings)? {
        builder.proxy(proxy)
    } else {
        builder
    };
    builder.build().context("failed to build HTTP client")
}

/// Open a readable stream over the content a bundle location names.
pub(crate) fn open_location(location: &str, settings: &CacheSettings) -> Result<Box<dyn Read + Send>> {
    let url = Url::parse(location).with_context(|| format!("invalid bundle location {location}"))?;
    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|()| anyhow!("location {location} does not name a local file"))?;
            let file =
                File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
            Ok(Box::new(file))
        }
        "http" | "https" => {
            debug!(%location, "fetching bundle content");
            let client = http_client(settings)?;
            let response = client
                .get(url.clone())
                .send()
                .with_context(|| format!("failed to fetch {location}"))?
                .error_for_status()
                .with_context(|| format!("failed to fetch {location}"))?;
            Ok(Box::new(response))
        }
        other => bail!("unsupported location scheme {other:?} in {location}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn keep_proxies_defaults_to_enabled_when_proxy_env_is_set() {
        let snapshot = EnvSnapshot::testing(&[("HTTP_PROXY", "http://proxy.example")]);
        assert!(keep_proxies(&snapshot));
        assert!(!keep_proxies(&EnvSnapshot::testing(&[])));
    }

    #[test]
    fn keep_proxies_respects_explicit_override() {
        let snapshot = EnvSnapshot::testing(&[
            ("BX_KEEP_PROXIES", "off"),
            ("HTTPS_PROXY", "http://proxy.example"),
        ]);
        assert!(!keep_proxies(&snapshot));
        assert!(keep_proxies(&EnvSnapshot::testing(&[("BX_KEEP_PROXIES", "1")])));
    }

    #[test]
    fn proxy_credentials_are_base64_encoded() {
        assert_eq!(
            proxy_authorization("Aladdin:open sesame"),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }

    #[test]
    fn credentials_need_a_proxy() -> Result<()> {
        let settings = CacheSettings {
            proxy_auth: Some("user:secret".to_string()),
            keep_proxies: true,
            ..CacheSettings::default()
        };
        assert!(authenticated_proxy(&settings)?.is_none());

        let settings = CacheSettings {
            proxy_url: Some("http://proxy.example:3128".to_string()),
            ..settings
        };
        assert!(authenticated_proxy(&settings)?.is_some());
        Ok(())
    }

    #[test]
    fn origin_requests_carry_no_proxy_credentials() -> Result<()> {
        use std::io::BufRead;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let server = std::thread::spawn(move || -> std::io::Result<String> {
            let (stream, _) = listener.accept()?;
            let mut reader = std::io::BufReader::new(stream.try_clone()?);
            let mut head = String::new();
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line)? == 0 || line == "\r\n" {
                    break;
                }
                head.push_str(&line);
            }
            let mut stream = stream;
            stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: close\r\n\r\njar",
            )?;
            Ok(head)
        });

        let settings = CacheSettings {
            proxy_auth: Some("user:secret".to_string()),
            ..CacheSettings::default()
        };
        let mut body = Vec::new();
        open_location(&format!("http://{addr}/bundle.jar"), &settings)?.read_to_end(&mut body)?;
        assert_eq!(body, b"jar");

        let head = server.join().map_err(|_| anyhow!("server thread panicked"))??;
        assert!(head.starts_with("GET /bundle.jar"));
        assert!(!head.to_ascii_lowercase().contains("proxy-authorization"));
        Ok(())
    }

    #[test]
    fn file_urls_open_local_files() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("payload.jar");
        File::create(&path)?.write_all(b"jar bytes")?;
        let url = Url::from_file_path(&path).map_err(|()| anyhow!("file url"))?;
        let mut stream = open_location(url.as_str(), &CacheSettings::default())?;
        let mut read = Vec::new();
        stream.read_to_end(&mut read)?;
        assert_eq!(read, b"jar bytes");
        Ok(())
    }

    #[test]
    fn unsupported_schemes_fail() {
        let err = open_location("ftp://example.com/b.jar", &CacheSettings::default())
            .err()
            .expect("ftp is unsupported");
        assert!(err.to_string().contains("unsupported location scheme"));
    }
}
