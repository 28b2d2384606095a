use std::{sync::Arc, time::Duration};

use cadenza_reqwest::ReqwestTransport;
use cadenza_tokens::{
    persist::{spawn_persistence, FileCredentialStore},
    ApiClient, ApiRequest, AuthorizationManager, ClientCredentialsManager, ClientId, ClientSecret,
    Endpoints,
};
use clap::Parser;
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The authorization server's token request URL
    #[clap(short, long, env, default_value = "https://accounts.spotify.com/api/token")]
    token_url: url::Url,

    /// The client ID of the client
    #[clap(short, long, env)]
    client_id: ClientId,

    /// The client secret used to identify the client to the authorization server
    #[clap(short = 's', long, env, hide_env_values = true)]
    client_secret: ClientSecret,

    /// The API resource to fetch periodically
    #[clap(
        short,
        long,
        env,
        default_value = "https://api.spotify.com/v1/browse/new-releases?limit=1"
    )]
    api_url: url::Url,

    /// The local file used to persist credentials
    #[clap(short = 'f', long, env, default_value = ".credentials.json")]
    credentials_file: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let client = reqwest::Client::builder().https_only(true).build()?;
    let transport = ReqwestTransport::new(client);
    let endpoints = Endpoints::default().with_token_url(opts.token_url);
    let store = FileCredentialStore::new(opts.credentials_file);

    let manager = match store.load().await? {
        Some(persisted) if persisted.client_id == opts.client_id => {
            tracing::info!(path = %store.path().display(), "resuming persisted authorization");
            ClientCredentialsManager::from_persisted(persisted, transport.clone())?
        }
        _ => ClientCredentialsManager::new(opts.client_id, opts.client_secret, transport.clone()),
    };
    let manager = Arc::new(manager.with_endpoints(endpoints));

    let _persistence = spawn_persistence(&manager, store);

    if !manager.is_authorized(&Default::default()) {
        manager.authorize().await?;
    }

    let api = ApiClient::new(manager.clone(), transport);
    let request = ApiRequest::get(opts.api_url);

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;

        match api.send::<serde_json::Value>(&request).await {
            Ok(body) => tracing::info!(
                expiration = ?manager.credentials().expiration_date(),
                body = %body,
                "fetched resource"
            ),
            Err(error) if error.requires_reauthorization() => {
                tracing::error!(error = &error as &dyn std::error::Error, "authorization lost");
                manager.deauthorize();
                manager.authorize().await?;
            }
            Err(error) => {
                tracing::warn!(error = &error as &dyn std::error::Error, "request failed")
            }
        }
    }
}
