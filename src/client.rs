use crate::{
    connection::{Config, Connection},
    request::Request,
    response::Response,
    types::H2Error,
};
use log::trace;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName},
    TlsConnector,
};
use url::Url;

/// TLS-backed client: one connection per request, ALPN pinned to `h2`.
pub struct Client {
    rustls_config: Arc<ClientConfig>,
    config: Config,
}

impl Client {
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub async fn get(&self, url: Url) -> Result<Response, H2Error> {
        self.request(Request::get(url, None)).await
    }

    pub async fn request(&self, request: Request) -> Result<Response, H2Error> {
        let url = &request.url;
        let host = url
            .host_str()
            .ok_or_else(|| H2Error::InvalidRequest("no host in URL".to_owned()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| H2Error::InvalidRequest("no port for URL".to_owned()))?;
        trace!("{} {} {:#?}", request.method(), url, request.headers);
        let server_name = ServerName::try_from(host)
            .map_err(|_| H2Error::InvalidRequest(format!("invalid host name {}", host)))?;
        let tcp = TcpStream::connect((host, port)).await?;
        let tls = TlsConnector::from(self.rustls_config.clone())
            .connect(server_name, tcp)
            .await?;
        let connection = Connection::connect(tls, self.config.clone()).await?;
        let response = connection.request(request).await?;
        trace!("Response: {:#?}", response);
        connection.shutdown().await.ok();
        Ok(response)
    }
}

impl Default for Client {
    fn default() -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let mut config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec()];
        Self {
            rustls_config: Arc::new(config),
            config: Config::default(),
        }
    }
}
