use std::time::Duration;

use domino_core::{MatchSettings, Variant};

use crate::{
    abuse::AbuseConfig, game::TurnConfig, matchmaking::MatchmakingConfig, rating::RatingConfig,
};

/// All tunables, read once at startup from the environment (after dotenvy
/// has loaded `.env`). Every value has a default so a bare environment runs.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub ws_port: u16,
    pub tcp_port: u16,
    pub settings: MatchSettings,
    pub players_per_match: usize,
    pub rated: bool,
    pub turn: TurnConfig,
    pub heartbeat_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Resync gaps larger than this are served a snapshot instead of deltas.
    pub snapshot_threshold: u64,
    pub matchmaking: MatchmakingConfig,
    pub rating: RatingConfig,
    pub abuse: AbuseConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            ws_port: 9800,
            tcp_port: 9801,
            settings: MatchSettings::default(),
            players_per_match: 2,
            rated: true,
            turn: TurnConfig::default(),
            heartbeat_timeout: Duration::from_secs(120),
            cleanup_interval: Duration::from_secs(30),
            snapshot_threshold: 32,
            matchmaking: MatchmakingConfig::default(),
            rating: RatingConfig::default(),
            abuse: AbuseConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            panic!("{} must be a valid {}", key, std::any::type_name::<T>())
        }),
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = ServerConfig::default();

        let variant = match std::env::var("DOMINO_VARIANT").as_deref() {
            Ok("double-nine") => Variant::DoubleNine,
            Ok("double-six") | Err(_) => Variant::DoubleSix,
            Ok(other) => panic!("DOMINO_VARIANT must be double-six or double-nine, got {other}"),
        };
        let settings = MatchSettings {
            variant,
            hand_size: env_parse("DOMINO_HAND_SIZE", defaults.settings.hand_size),
            ..defaults.settings
        };

        let turn = TurnConfig {
            turn_duration: env_secs("DOMINO_TURN_SECS", defaults.turn.turn_duration),
            grace_count: env_parse("DOMINO_GRACE_COUNT", defaults.turn.grace_count),
            grace_duration: env_secs("DOMINO_GRACE_SECS", defaults.turn.grace_duration),
        };

        let matchmaking = MatchmakingConfig {
            sweep_interval: env_secs(
                "DOMINO_MM_SWEEP_SECS",
                defaults.matchmaking.sweep_interval,
            ),
            initial_band: env_parse("DOMINO_MM_BAND", defaults.matchmaking.initial_band),
            band_widen: env_parse("DOMINO_MM_BAND_WIDEN", defaults.matchmaking.band_widen),
            max_band: env_parse("DOMINO_MM_MAX_BAND", defaults.matchmaking.max_band),
            max_wait: env_secs("DOMINO_MM_MAX_WAIT_SECS", defaults.matchmaking.max_wait),
        };

        let rating = RatingConfig {
            k: env_parse("DOMINO_ELO_K", defaults.rating.k),
            divisor: env_parse("DOMINO_ELO_DIVISOR", defaults.rating.divisor),
            initial: env_parse("DOMINO_ELO_INITIAL", defaults.rating.initial),
            damping_games: env_parse("DOMINO_ELO_DAMPING_GAMES", defaults.rating.damping_games),
            decay_after: env_secs("DOMINO_DECAY_AFTER_SECS", defaults.rating.decay_after),
            decay_fraction: env_parse("DOMINO_DECAY_FRACTION", defaults.rating.decay_fraction),
            baseline: env_parse("DOMINO_DECAY_BASELINE", defaults.rating.baseline),
            floor: env_parse("DOMINO_RATING_FLOOR", defaults.rating.floor),
            sweep_interval: env_secs(
                "DOMINO_DECAY_SWEEP_SECS",
                defaults.rating.sweep_interval,
            ),
        };

        let abuse = AbuseConfig {
            min_reaction: Duration::from_millis(env_parse(
                "DOMINO_MIN_REACTION_MS",
                defaults.abuse.min_reaction.as_millis() as u64,
            )),
            warn_streak: env_parse("DOMINO_FAST_WARN_STREAK", defaults.abuse.warn_streak),
            suspend_streak: env_parse(
                "DOMINO_FAST_SUSPEND_STREAK",
                defaults.abuse.suspend_streak,
            ),
            collusion_min_games: env_parse(
                "DOMINO_COLLUSION_MIN_GAMES",
                defaults.abuse.collusion_min_games,
            ),
            collusion_onesided_ratio: env_parse(
                "DOMINO_COLLUSION_RATIO",
                defaults.abuse.collusion_onesided_ratio,
            ),
        };

        ServerConfig {
            ws_port: env_parse("DOMINO_WS_PORT", defaults.ws_port),
            tcp_port: env_parse("DOMINO_TCP_PORT", defaults.tcp_port),
            settings,
            players_per_match: env_parse("DOMINO_PLAYERS_PER_MATCH", defaults.players_per_match),
            rated: env_parse("DOMINO_RATED", defaults.rated),
            turn,
            heartbeat_timeout: env_secs("DOMINO_HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout),
            cleanup_interval: env_secs("DOMINO_CLEANUP_SECS", defaults.cleanup_interval),
            snapshot_threshold: env_parse(
                "DOMINO_SNAPSHOT_THRESHOLD",
                defaults.snapshot_threshold,
            ),
            matchmaking,
            rating,
            abuse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = ServerConfig::default();
        assert!(config.settings.is_valid());
        assert!(config.players_per_match >= domino_core::MIN_PLAYERS);
        assert!(config.turn.turn_duration > config.turn.grace_duration);
        assert!(config.matchmaking.initial_band <= config.matchmaking.max_band);
        assert!(config.rating.floor <= config.rating.baseline);
    }
}
