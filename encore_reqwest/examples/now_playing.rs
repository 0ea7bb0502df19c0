use std::{path::PathBuf, time::Duration};

use clap::Parser;
use encore_clock::{Clock, System};
use encore_reqwest::AuthenticatedClient;
use encore_tokens::{
    authority::BackendRefreshAuthority,
    store::{FileStore, TokenStore},
    AccessToken, IdentityToken, ManagerConfig, RefreshToken, TokenManager, TokenState,
};
use serde::Deserialize;
use tokio::time;

#[derive(Debug, Parser)]
#[command(about = "Prints what the linked Spotify account is currently playing")]
struct Opts {
    /// The application backend's token refresh URL
    #[arg(short, long, env)]
    refresh_url: reqwest::Url,

    /// The local file holding the linked account's credentials
    #[arg(short = 'f', long, env, default_value = ".encore/tokens.json")]
    credentials_file: PathBuf,

    /// Link the account with this access token before fetching
    #[arg(long, env, hide_env_values = true, requires_all = ["refresh_token", "identity_token"])]
    access_token: Option<AccessToken>,

    /// The refresh token obtained when linking the account
    #[arg(long, env, hide_env_values = true)]
    refresh_token: Option<RefreshToken>,

    /// The identity token authorizing calls to the application backend
    #[arg(long, env, hide_env_values = true)]
    identity_token: Option<IdentityToken>,

    /// Seconds until the linked access token expires
    #[arg(long, env, default_value_t = 3600)]
    expires_in: u64,

    /// Poll every few seconds instead of fetching once
    #[arg(short, long)]
    watch: bool,
}

#[derive(Debug, Deserialize)]
struct CurrentlyPlaying {
    is_playing: bool,
    progress_ms: Option<u64>,
    item: Option<Track>,
}

#[derive(Debug, Deserialize)]
struct Track {
    name: String,
    artists: Vec<Artist>,
}

#[derive(Debug, Deserialize)]
struct Artist {
    name: String,
}

const CURRENTLY_PLAYING_URL: &str = "https://api.spotify.com/v1/me/player/currently-playing";

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .https_only(true)
        .build()?;

    let manager = TokenManager::new(
        TokenStore::new(FileStore::new(opts.credentials_file)),
        BackendRefreshAuthority::new(client.clone(), opts.refresh_url),
        ManagerConfig::default(),
    );

    if let (Some(access_token), Some(refresh_token), Some(identity_token)) =
        (opts.access_token, opts.refresh_token, opts.identity_token)
    {
        let state = TokenState::new(
            access_token,
            refresh_token,
            System.now() + Duration::from_secs(opts.expires_in),
            identity_token,
        );
        manager.connect(&state).await?;
    }

    if !manager.is_connected().await? {
        tracing::warn!("spotify account is not linked; supply credentials to link it");
        return Ok(());
    }

    let client = AuthenticatedClient::new(client, manager);
    let url: reqwest::Url = CURRENTLY_PLAYING_URL.parse()?;

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;

        match client.fetch_with_token::<Option<CurrentlyPlaying>>(url.clone()).await {
            Ok(Some(CurrentlyPlaying {
                is_playing,
                progress_ms,
                item: Some(track),
            })) => {
                let artists = track
                    .artists
                    .iter()
                    .map(|a| a.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                tracing::info!(
                    track = %track.name,
                    %artists,
                    is_playing,
                    progress_ms,
                    "currently playing"
                );
            }
            Ok(_) => tracing::info!("nothing is playing"),
            Err(error) if error.requires_reconnect() => {
                tracing::error!(
                    error = (&error as &dyn std::error::Error),
                    "spotify account must be linked again"
                );
                return Ok(());
            }
            Err(error) => {
                let status = client.manager().token_status().await?;
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    token.status = ?status,
                    "unable to fetch currently playing track"
                );
            }
        }

        if !opts.watch {
            return Ok(());
        }
    }
}
