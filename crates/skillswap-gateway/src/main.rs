use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result as AnyResult};
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::{
        IntoResponse, Redirect, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, post},
};
use futures_util::{Stream, StreamExt, stream};
use redis::Msg;
use serde::{Deserialize, Serialize};
use skillswap_analytics::StoreAnalytics;
use skillswap_catalog::Catalog;
use skillswap_core::{
    AnalyticsAggregator, ChangeEvent, ChangeTopic, CreditTransaction, EngagementAnalytics,
    Exchange, Feedback, LearningAnalytics, MarketConfig, MarketError, Message, Notification,
    OfferingDraft, RequestDraft, SharedSink, SharedStore, SkillCategory, SkillOffering,
    SkillRequest, Swap, TeachingAnalytics, UserId, UserRating,
};
use skillswap_exchange::{
    ExchangeDetail, ExchangeProposal, ExchangeService, MessageService, Notifier, SwapProposal,
    SwapService,
};
use skillswap_ledger::CreditLedger;
use skillswap_matcher::{DefaultMatchScorer, Matcher, OfferingMatch, ReciprocalMatch};
use skillswap_platform::{
    BalanceResponse, CHANGE_CHANNELS, MarkAllReadResponse, MatchesQuery, NotificationsQuery,
    OfferingsQuery, PgMarketStore, RatingsRequest, RedisBus, RequestsQuery,
    ScheduleSessionRequest, SendMessageRequest, ServiceConfig, UpdateExchangeStatusRequest,
    apply_schema, connect_database,
};
use skillswap_store::{ChangeFeed, Subscription};
use tracing::{error, info, warn};
use uuid::Uuid;

const USER_HEADER: &str = "x-user-id";
const FORWARDER_RETRY: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct AppState {
    catalog: Catalog,
    ledger: CreditLedger,
    matcher: Matcher,
    swaps: SwapService,
    exchanges: ExchangeService,
    messages: MessageService,
    notifier: Notifier,
    analytics: Arc<dyn AnalyticsAggregator>,
    feed: ChangeFeed,
    market: MarketConfig,
}

/// Caller identity asserted by the upstream auth layer.
struct CurrentUser(UserId);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok());
        parse_user_id(raw).map(CurrentUser).map_err(market_error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DashboardResponse {
    balance: i64,
    unread_notifications: usize,
    active_swaps: Vec<Swap>,
    top_matches: Vec<ReciprocalMatch>,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "skillswap_gateway=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8080")?;
    let pool = connect_database(&config.database_url).await?;
    apply_schema(&pool).await?;
    let redis = RedisBus::connect(&config.redis_url)?;

    let store: SharedStore = Arc::new(PgMarketStore::new(pool));
    let sink: SharedSink = Arc::new(redis.clone());
    let feed = ChangeFeed::default();
    tokio::spawn(run_change_forwarder(redis, feed.clone()));

    let analytics: Arc<dyn AnalyticsAggregator> = Arc::new(StoreAnalytics::new(store.clone()));
    let notifier = Notifier::new(store.clone(), sink);
    let ledger = CreditLedger::new(store.clone(), &config.market);
    let state = AppState {
        catalog: Catalog::new(store.clone(), analytics.clone()),
        matcher: Matcher::new(
            store.clone(),
            Arc::new(DefaultMatchScorer),
            analytics.clone(),
        ),
        swaps: SwapService::new(store.clone(), notifier.clone()),
        exchanges: ExchangeService::new(
            store.clone(),
            ledger.clone(),
            notifier.clone(),
            &config.market,
        ),
        messages: MessageService::new(store.clone(), notifier.clone()),
        ledger,
        notifier,
        analytics,
        feed,
        market: config.market.clone(),
    };

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/dashboard", get(dashboard))
        .route("/categories", get(list_categories))
        .route("/offerings", get(list_offerings).post(create_offering))
        .route(
            "/offerings/{offering_id}",
            get(get_offering)
                .put(update_offering)
                .delete(delete_offering),
        )
        .route(
            "/offerings/{offering_id}/deactivate",
            post(deactivate_offering),
        )
        .route("/requests", get(list_requests).post(create_request))
        .route(
            "/requests/{request_id}",
            get(get_request).put(update_request).delete(delete_request),
        )
        .route("/requests/{request_id}/deactivate", post(deactivate_request))
        .route("/requests/{request_id}/matches", get(request_matches))
        .route("/matches/reciprocal", get(reciprocal_matches))
        .route("/credits/balance", get(credit_balance))
        .route("/credits/transactions", get(credit_transactions))
        .route("/swaps", get(list_swaps).post(create_swap))
        .route("/swaps/{swap_id}", get(get_swap))
        .route("/swaps/{swap_id}/accept", post(accept_swap))
        .route("/swaps/{swap_id}/reject", post(reject_swap))
        .route("/swaps/{swap_id}/start", post(start_swap))
        .route("/swaps/{swap_id}/complete", post(complete_swap))
        .route("/swaps/{swap_id}/feedback", post(leave_swap_feedback))
        .route("/swaps/{swap_id}/cancel", post(cancel_swap))
        .route("/swaps/{swap_id}/sessions", post(add_session))
        .route("/swaps/{swap_id}/sessions/{index}", delete(remove_session))
        .route("/exchanges", get(list_exchanges).post(create_exchange))
        .route("/exchanges/{exchange_id}", get(get_exchange))
        .route(
            "/exchanges/{exchange_id}/status",
            post(update_exchange_status),
        )
        .route(
            "/exchanges/{exchange_id}/messages",
            get(list_messages).post(send_message),
        )
        .route("/exchanges/{exchange_id}/events", get(exchange_events))
        .route("/notifications", get(list_notifications))
        .route(
            "/notifications/{notification_id}/read",
            post(mark_notification_read),
        )
        .route("/notifications/read-all", post(mark_all_notifications_read))
        .route("/notifications/events", get(notification_events))
        .route("/analytics/teaching", get(teaching_analytics))
        .route("/analytics/learning", get(learning_analytics))
        .route("/analytics/engagement", get(engagement_analytics))
        .route("/analytics/ratings", post(average_ratings))
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn dashboard(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<DashboardResponse>, (StatusCode, String)> {
    let balance = state
        .ledger
        .get_balance(user_id)
        .await
        .map_err(market_error)?;
    let unread_notifications = state
        .notifier
        .list(user_id, true)
        .await
        .map_err(market_error)?
        .len();
    let active_swaps = state
        .swaps
        .swaps_for(user_id)
        .await
        .map_err(market_error)?
        .into_iter()
        .filter(|swap| swap.status.is_active())
        .collect();
    let top_matches = state
        .matcher
        .find_reciprocal_matches(user_id, Some(state.market.dashboard_match_limit))
        .await
        .map_err(market_error)?;

    Ok(Json(DashboardResponse {
        balance,
        unread_notifications,
        active_swaps,
        top_matches,
    }))
}

async fn list_categories(
    State(state): State<AppState>,
) -> Result<Json<Vec<SkillCategory>>, (StatusCode, String)> {
    let categories = state.catalog.categories().await.map_err(market_error)?;
    Ok(Json(categories))
}

async fn list_offerings(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<OfferingsQuery>,
) -> Result<Json<Vec<SkillOffering>>, (StatusCode, String)> {
    if query.mine {
        let offerings = state
            .catalog
            .offerings_of(user_id)
            .await
            .map_err(market_error)?;
        return Ok(Json(offerings));
    }
    let filter = query.into_filter(user_id).map_err(invalid_request)?;
    let offerings = state
        .catalog
        .list_active_offerings(&filter)
        .await
        .map_err(market_error)?;
    Ok(Json(offerings))
}

async fn create_offering(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(payload): Json<OfferingDraft>,
) -> Result<(StatusCode, Json<SkillOffering>), (StatusCode, String)> {
    let offering = state
        .catalog
        .create_offering(user_id, payload)
        .await
        .map_err(market_error)?;
    Ok((StatusCode::CREATED, Json(offering)))
}

async fn get_offering(
    State(state): State<AppState>,
    CurrentUser(_user_id): CurrentUser,
    Path(offering_id): Path<Uuid>,
) -> Result<Json<SkillOffering>, (StatusCode, String)> {
    let offering = state
        .catalog
        .offering(offering_id)
        .await
        .map_err(market_error)?;
    Ok(Json(offering))
}

async fn update_offering(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(offering_id): Path<Uuid>,
    Json(payload): Json<OfferingDraft>,
) -> Result<Json<SkillOffering>, (StatusCode, String)> {
    let offering = state
        .catalog
        .update_offering(user_id, offering_id, payload)
        .await
        .map_err(market_error)?;
    Ok(Json(offering))
}

async fn deactivate_offering(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(offering_id): Path<Uuid>,
) -> Result<Json<SkillOffering>, (StatusCode, String)> {
    let offering = state
        .catalog
        .deactivate_offering(user_id, offering_id)
        .await
        .map_err(market_error)?;
    Ok(Json(offering))
}

async fn delete_offering(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(offering_id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .catalog
        .delete_offering(user_id, offering_id)
        .await
        .map_err(market_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_requests(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<RequestsQuery>,
) -> Result<Json<Vec<SkillRequest>>, (StatusCode, String)> {
    let filter = query.into_filter(user_id).map_err(invalid_request)?;
    let requests = state
        .catalog
        .list_requests(&filter)
        .await
        .map_err(market_error)?;
    Ok(Json(requests))
}

async fn create_request(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(payload): Json<RequestDraft>,
) -> Result<(StatusCode, Json<SkillRequest>), (StatusCode, String)> {
    let request = state
        .catalog
        .create_request(user_id, payload)
        .await
        .map_err(market_error)?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn get_request(
    State(state): State<AppState>,
    CurrentUser(_user_id): CurrentUser,
    Path(request_id): Path<Uuid>,
) -> Result<Json<SkillRequest>, (StatusCode, String)> {
    let request = state
        .catalog
        .request(request_id)
        .await
        .map_err(market_error)?;
    Ok(Json(request))
}

async fn update_request(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(request_id): Path<Uuid>,
    Json(payload): Json<RequestDraft>,
) -> Result<Json<SkillRequest>, (StatusCode, String)> {
    let request = state
        .catalog
        .update_request(user_id, request_id, payload)
        .await
        .map_err(market_error)?;
    Ok(Json(request))
}

async fn deactivate_request(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(request_id): Path<Uuid>,
) -> Result<Json<SkillRequest>, (StatusCode, String)> {
    let request = state
        .catalog
        .deactivate_request(user_id, request_id)
        .await
        .map_err(market_error)?;
    Ok(Json(request))
}

async fn delete_request(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(request_id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .catalog
        .delete_request(user_id, request_id)
        .await
        .map_err(market_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn request_matches(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(request_id): Path<Uuid>,
) -> Result<Json<Vec<OfferingMatch>>, (StatusCode, String)> {
    let request = state
        .catalog
        .request(request_id)
        .await
        .map_err(market_error)?;
    if request.owner_id != user_id {
        return Err(market_error(MarketError::not_found("request", request_id)));
    }
    let matches = state
        .matcher
        .find_potential_matches_for_request(request_id)
        .await
        .map_err(market_error)?;
    Ok(Json(matches))
}

async fn reciprocal_matches(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<MatchesQuery>,
) -> Result<Json<Vec<ReciprocalMatch>>, (StatusCode, String)> {
    let matches = state
        .matcher
        .find_reciprocal_matches(user_id, query.limit)
        .await
        .map_err(market_error)?;
    Ok(Json(matches))
}

async fn credit_balance(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<BalanceResponse>, (StatusCode, String)> {
    let balance = state
        .ledger
        .get_balance(user_id)
        .await
        .map_err(market_error)?;
    Ok(Json(BalanceResponse { user_id, balance }))
}

async fn credit_transactions(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<Vec<CreditTransaction>>, (StatusCode, String)> {
    let transactions = state.ledger.history(user_id).await.map_err(market_error)?;
    Ok(Json(transactions))
}

async fn list_swaps(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<Vec<Swap>>, (StatusCode, String)> {
    let swaps = state.swaps.swaps_for(user_id).await.map_err(market_error)?;
    Ok(Json(swaps))
}

/// A repeat proposal redirects to the swap already in flight.
async fn create_swap(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(payload): Json<SwapProposal>,
) -> Result<Response, (StatusCode, String)> {
    match state.swaps.create(user_id, payload).await {
        Ok(swap) => Ok((StatusCode::CREATED, Json(swap)).into_response()),
        Err(MarketError::DuplicateProposal { existing_swap_id }) => {
            Ok(Redirect::to(&format!("/swaps/{existing_swap_id}")).into_response())
        }
        Err(err) => Err(market_error(err)),
    }
}

async fn get_swap(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(swap_id): Path<Uuid>,
) -> Result<Json<Swap>, (StatusCode, String)> {
    let swap = state
        .swaps
        .swap(user_id, swap_id)
        .await
        .map_err(market_error)?;
    Ok(Json(swap))
}

async fn accept_swap(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(swap_id): Path<Uuid>,
) -> Result<Json<Swap>, (StatusCode, String)> {
    let swap = state
        .swaps
        .accept(user_id, swap_id)
        .await
        .map_err(market_error)?;
    Ok(Json(swap))
}

async fn reject_swap(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(swap_id): Path<Uuid>,
) -> Result<Json<Swap>, (StatusCode, String)> {
    let swap = state
        .swaps
        .reject(user_id, swap_id)
        .await
        .map_err(market_error)?;
    Ok(Json(swap))
}

async fn start_swap(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(swap_id): Path<Uuid>,
) -> Result<Json<Swap>, (StatusCode, String)> {
    let swap = state
        .swaps
        .start(user_id, swap_id)
        .await
        .map_err(market_error)?;
    Ok(Json(swap))
}

async fn complete_swap(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(swap_id): Path<Uuid>,
    payload: Option<Json<Feedback>>,
) -> Result<Json<Swap>, (StatusCode, String)> {
    let feedback = payload.map(|Json(feedback)| feedback).unwrap_or_default();
    let swap = state
        .swaps
        .complete(user_id, swap_id, feedback)
        .await
        .map_err(market_error)?;
    Ok(Json(swap))
}

async fn leave_swap_feedback(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(swap_id): Path<Uuid>,
    Json(payload): Json<Feedback>,
) -> Result<Json<Swap>, (StatusCode, String)> {
    let swap = state
        .swaps
        .leave_feedback(user_id, swap_id, payload)
        .await
        .map_err(market_error)?;
    Ok(Json(swap))
}

async fn cancel_swap(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(swap_id): Path<Uuid>,
) -> Result<Json<Swap>, (StatusCode, String)> {
    let swap = state
        .swaps
        .cancel(user_id, swap_id)
        .await
        .map_err(market_error)?;
    Ok(Json(swap))
}

async fn add_session(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(swap_id): Path<Uuid>,
    Json(payload): Json<ScheduleSessionRequest>,
) -> Result<Json<Swap>, (StatusCode, String)> {
    let swap = state
        .swaps
        .add_scheduled_session(user_id, swap_id, payload.at)
        .await
        .map_err(market_error)?;
    Ok(Json(swap))
}

async fn remove_session(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path((swap_id, index)): Path<(Uuid, usize)>,
) -> Result<Json<Swap>, (StatusCode, String)> {
    let swap = state
        .swaps
        .remove_scheduled_session(user_id, swap_id, index)
        .await
        .map_err(market_error)?;
    Ok(Json(swap))
}

async fn list_exchanges(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<Vec<Exchange>>, (StatusCode, String)> {
    let exchanges = state
        .exchanges
        .exchanges_for(user_id)
        .await
        .map_err(market_error)?;
    Ok(Json(exchanges))
}

async fn create_exchange(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(payload): Json<ExchangeProposal>,
) -> Result<(StatusCode, Json<Exchange>), (StatusCode, String)> {
    let exchange = state
        .exchanges
        .propose(user_id, payload)
        .await
        .map_err(market_error)?;
    Ok((StatusCode::CREATED, Json(exchange)))
}

async fn get_exchange(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(exchange_id): Path<Uuid>,
) -> Result<Json<ExchangeDetail>, (StatusCode, String)> {
    let detail = state
        .exchanges
        .exchange(user_id, exchange_id)
        .await
        .map_err(market_error)?;
    Ok(Json(detail))
}

async fn update_exchange_status(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(exchange_id): Path<Uuid>,
    Json(payload): Json<UpdateExchangeStatusRequest>,
) -> Result<Json<Exchange>, (StatusCode, String)> {
    let exchange = state
        .exchanges
        .update_status(user_id, exchange_id, payload.status)
        .await
        .map_err(market_error)?;
    Ok(Json(exchange))
}

async fn list_messages(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(exchange_id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, (StatusCode, String)> {
    let messages = state
        .messages
        .list(user_id, exchange_id)
        .await
        .map_err(market_error)?;
    Ok(Json(messages))
}

async fn send_message(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(exchange_id): Path<Uuid>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), (StatusCode, String)> {
    let message = state
        .messages
        .send(user_id, exchange_id, &payload.content)
        .await
        .map_err(market_error)?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn exchange_events(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(exchange_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    state
        .exchanges
        .exchange(user_id, exchange_id)
        .await
        .map_err(market_error)?;
    let subscription = state.feed.subscribe(ChangeTopic::Messages { exchange_id });
    Ok(Sse::new(change_stream(subscription)).keep_alive(KeepAlive::default()))
}

async fn list_notifications(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<NotificationsQuery>,
) -> Result<Json<Vec<Notification>>, (StatusCode, String)> {
    let notifications = state
        .notifier
        .list(user_id, query.unread_only)
        .await
        .map_err(market_error)?;
    Ok(Json(notifications))
}

async fn mark_notification_read(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(notification_id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .notifier
        .mark_read(user_id, notification_id)
        .await
        .map_err(market_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_all_notifications_read(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<MarkAllReadResponse>, (StatusCode, String)> {
    let updated = state
        .notifier
        .mark_all_read(user_id)
        .await
        .map_err(market_error)?;
    Ok(Json(MarkAllReadResponse { updated }))
}

async fn notification_events(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.feed.subscribe(ChangeTopic::Notifications { user_id });
    Sse::new(change_stream(subscription)).keep_alive(KeepAlive::default())
}

async fn teaching_analytics(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<TeachingAnalytics>, (StatusCode, String)> {
    let analytics = state
        .analytics
        .teaching(user_id)
        .await
        .map_err(market_error)?;
    Ok(Json(analytics))
}

async fn learning_analytics(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<LearningAnalytics>, (StatusCode, String)> {
    let analytics = state
        .analytics
        .learning(user_id)
        .await
        .map_err(market_error)?;
    Ok(Json(analytics))
}

async fn engagement_analytics(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<EngagementAnalytics>, (StatusCode, String)> {
    let analytics = state
        .analytics
        .engagement(user_id)
        .await
        .map_err(market_error)?;
    Ok(Json(analytics))
}

async fn average_ratings(
    State(state): State<AppState>,
    CurrentUser(_user_id): CurrentUser,
    Json(payload): Json<RatingsRequest>,
) -> Result<Json<Vec<UserRating>>, (StatusCode, String)> {
    let ratings = state
        .analytics
        .average_ratings(&payload.user_ids)
        .await
        .map_err(market_error)?;
    Ok(Json(ratings))
}

/// Turns a subscription into SSE events; the subscription, and with it the
/// broadcast receiver, is dropped when the client disconnects.
fn change_stream(subscription: Subscription) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(subscription, |mut subscription| async move {
        let change = subscription.next().await?;
        let name = match &change {
            ChangeEvent::NotificationCreated(_) => "notification",
            ChangeEvent::MessageCreated(_) => "message",
        };
        let event = match Event::default().event(name).json_data(&change) {
            Ok(event) => event,
            Err(err) => {
                warn!("failed to encode change event: {err}");
                Event::default().comment("undeliverable change")
            }
        };
        Some((Ok(event), subscription))
    })
}

/// Keeps the Redis subscription alive for the life of the process.
async fn run_change_forwarder(redis: RedisBus, feed: ChangeFeed) {
    loop {
        if let Err(err) = forward_changes(&redis, &feed).await {
            error!("change forwarder stopped: {err:#}");
        }
        tokio::time::sleep(FORWARDER_RETRY).await;
    }
}

async fn forward_changes(redis: &RedisBus, feed: &ChangeFeed) -> AnyResult<()> {
    let mut pubsub = redis.client().get_async_pubsub().await?;
    for channel in CHANGE_CHANNELS {
        pubsub.subscribe(channel).await?;
    }
    let mut messages = pubsub.on_message();

    info!("gateway subscribed to {}", CHANGE_CHANNELS.join(", "));

    loop {
        let msg = messages
            .next()
            .await
            .context("change stream ended unexpectedly")?;
        match decode_change(&msg) {
            Ok(event) => {
                feed.broadcast(event);
            }
            Err(err) => warn!("dropping malformed change event: {err:#}"),
        }
    }
}

fn decode_change(msg: &Msg) -> AnyResult<ChangeEvent> {
    let payload: String = msg.get_payload()?;
    let event = serde_json::from_str(&payload)
        .with_context(|| format!("invalid payload on {}", msg.get_channel_name()))?;
    Ok(event)
}

fn parse_user_id(raw: Option<&str>) -> Result<UserId, MarketError> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| Uuid::parse_str(value).ok())
        .ok_or(MarketError::Unauthenticated)
}

fn market_error(err: MarketError) -> (StatusCode, String) {
    let status = match &err {
        MarketError::Unauthenticated => StatusCode::UNAUTHORIZED,
        MarketError::Unauthorized(_) => StatusCode::FORBIDDEN,
        MarketError::NotFound { .. } => StatusCode::NOT_FOUND,
        MarketError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
        MarketError::HasActiveExchanges { .. }
        | MarketError::Conflict { .. }
        | MarketError::DuplicateProposal { .. }
        | MarketError::InvalidTransition { .. } => StatusCode::CONFLICT,
        MarketError::IndexOutOfRange { .. } | MarketError::Validation(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        MarketError::LedgerMismatch { .. } | MarketError::Storage(_) => {
            error!("request failed: {err:#}");
            return internal_error(err);
        }
    };
    (status, err.to_string())
}

fn invalid_request(err: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, err.to_string())
}

fn internal_error<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[cfg(test)]
mod tests {
    use skillswap_core::Status;

    use super::*;

    #[test]
    fn missing_or_malformed_identity_is_unauthenticated() {
        assert!(matches!(parse_user_id(None), Err(MarketError::Unauthenticated)));
        assert!(matches!(
            parse_user_id(Some("  ")),
            Err(MarketError::Unauthenticated)
        ));
        assert!(matches!(
            parse_user_id(Some("alice")),
            Err(MarketError::Unauthenticated)
        ));

        let user_id = Uuid::new_v4();
        let parsed = parse_user_id(Some(&format!(" {user_id} "))).expect("valid id");
        assert_eq!(parsed, user_id);
    }

    #[test]
    fn domain_errors_map_to_statuses() {
        let id = Uuid::new_v4();
        let cases = [
            (MarketError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (MarketError::unauthorized("nope"), StatusCode::FORBIDDEN),
            (MarketError::not_found("swap", id), StatusCode::NOT_FOUND),
            (
                MarketError::InsufficientCredits {
                    balance: 3,
                    required: 5,
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                MarketError::HasActiveExchanges {
                    entity: "offering",
                    id,
                },
                StatusCode::CONFLICT,
            ),
            (
                MarketError::InvalidTransition {
                    from: Status::Rejected,
                    to: Status::Completed,
                },
                StatusCode::CONFLICT,
            ),
            (
                MarketError::Conflict { entity: "swap", id },
                StatusCode::CONFLICT,
            ),
            (
                MarketError::IndexOutOfRange { index: 3, len: 1 },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                MarketError::Storage(anyhow::anyhow!("connection reset")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(market_error(err).0, expected);
        }
    }

    #[test]
    fn insufficient_credits_message_carries_amounts() {
        let (_, body) = market_error(MarketError::InsufficientCredits {
            balance: 3,
            required: 5,
        });
        assert!(body.contains('3') && body.contains('5'));
    }
}
