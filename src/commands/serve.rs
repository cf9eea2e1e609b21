use crate::config;
use crate::error::{Error, Result};
use crate::relay::{self, RelayConfig, RelayState};

/// Run the signalling server until the process is stopped.
pub async fn run(
    http: String,
    stun: String,
    turn: String,
    turn_user: String,
    bearer: String,
    slot_timeout: String,
) -> Result<()> {
    if !turn.is_empty() && turn_user.is_empty() {
        return Err(Error::Config(
            "cannot use a TURN server without a secret".into(),
        ));
    }
    let slot_timeout = config::parse_duration(&slot_timeout)
        .ok_or_else(|| Error::Config(format!("invalid slot timeout: {:?}", slot_timeout)))?;

    let state = RelayState::new(RelayConfig {
        bearer,
        slot_timeout,
        stun_servers: stun
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        turn_server: turn,
        turn_user,
    });

    let app = relay::router(state);
    let listener = tokio::net::TcpListener::bind(&http).await?;
    log::info!("signalling server listening on {}", http);
    axum::serve(listener, app).await?;
    Ok(())
}
