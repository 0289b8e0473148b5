use std::sync::{Arc, OnceLock};

use log::info;
use tokio_util::sync::CancellationToken;

use crate::{
    abuse::{AbuseService, AbuseServiceImpl, ModerationSink},
    client::TransportService,
    config::ServerConfig,
    game::{MatchService, MatchServiceImpl},
    matchmaking::{MatchmakingService, MatchmakingServiceImpl},
    persistence::{DeadLetterLog, MatchHistoryRepository, RatingRepository},
    rating::{RatingService, RatingServiceImpl},
};

pub type ArcTransportService = Arc<Box<dyn TransportService + Send + Sync + 'static>>;
pub type ArcMatchService = Arc<Box<dyn MatchService + Send + Sync + 'static>>;
pub type ArcMatchmakingService = Arc<Box<dyn MatchmakingService + Send + Sync + 'static>>;
pub type ArcRatingService = Arc<Box<dyn RatingService + Send + Sync + 'static>>;
pub type ArcAbuseService = Arc<Box<dyn AbuseService + Send + Sync + 'static>>;
pub type ArcModerationSink = Arc<Box<dyn ModerationSink + Send + Sync + 'static>>;
pub type ArcMatchHistoryRepository = Arc<Box<dyn MatchHistoryRepository + Send + Sync + 'static>>;
pub type ArcRatingRepository = Arc<Box<dyn RatingRepository + Send + Sync + 'static>>;

#[derive(Clone)]
pub struct AppState {
    pub transport_service: ArcTransportService,
    pub match_service: ArcMatchService,
    pub matchmaking_service: ArcMatchmakingService,
    pub rating_service: ArcRatingService,
    pub abuse_service: ArcAbuseService,
    pub match_history_repository: ArcMatchHistoryRepository,
    pub rating_repository: ArcRatingRepository,
    pub config: ServerConfig,
    pub shutdown: CancellationToken,
}

/// The transport is constructed before the services it dispatches into, so
/// it holds this and resolves the app state on first use.
#[derive(Clone, Default)]
pub struct LazyAppState(Arc<OnceLock<AppState>>);

impl LazyAppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, app: AppState) {
        self.0.set(app).ok().expect("app state already constructed");
    }

    pub fn unwrap(&self) -> &AppState {
        self.0.get().expect("app state not yet constructed")
    }
}

/// Build the service graph in dependency order, launch the background
/// sweepers, and publish the result through `lazy`.
pub fn construct_app(
    lazy: &LazyAppState,
    config: ServerConfig,
    transport_service: ArcTransportService,
    match_history_repository: ArcMatchHistoryRepository,
    rating_repository: ArcRatingRepository,
    moderation_sink: ArcModerationSink,
) -> AppState {
    let shutdown = CancellationToken::new();
    let dead_letters = Arc::new(DeadLetterLog::new());

    let rating_impl = RatingServiceImpl::new(
        config.rating.clone(),
        rating_repository.clone(),
        dead_letters.clone(),
    );
    rating_impl.run_decay_sweeper(shutdown.clone());
    let rating_service: ArcRatingService = Arc::new(Box::new(rating_impl));

    let abuse_service: ArcAbuseService = Arc::new(Box::new(AbuseServiceImpl::new(
        config.abuse.clone(),
        moderation_sink,
    )));

    let match_service: ArcMatchService = Arc::new(Box::new(MatchServiceImpl::new(
        config.settings,
        config.turn.clone(),
        config.snapshot_threshold,
        transport_service.clone(),
        rating_service.clone(),
        abuse_service.clone(),
        match_history_repository.clone(),
        dead_letters,
    )));

    let matchmaking_impl = MatchmakingServiceImpl::new(
        config.matchmaking.clone(),
        config.players_per_match,
        config.rated,
        match_service.clone(),
        rating_service.clone(),
        abuse_service.clone(),
    );
    matchmaking_impl.run_sweeper(shutdown.clone());
    let matchmaking_service: ArcMatchmakingService = Arc::new(Box::new(matchmaking_impl));

    let app = AppState {
        transport_service,
        match_service,
        matchmaking_service,
        rating_service,
        abuse_service,
        match_history_repository,
        rating_repository,
        config,
        shutdown,
    };
    lazy.set(app.clone());
    info!("application services constructed");
    app
}
