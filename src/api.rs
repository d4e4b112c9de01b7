// src/api.rs
use crate::auth::{Accounts, Session};
use crate::broker::Broker;
use crate::error::AppError;
use crate::models::{FundingForm, LoginForm, QuoteForm, RegisterForm, TradeForm};
use crate::money::usd;
use crate::session::{Context, SessionStore, SESSION_COOKIE};
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const MAX_FORM_BYTES: u64 = 16 * 1024;

pub fn routes(
    broker: Arc<Broker>,
    accounts: Arc<Accounts>,
    sessions: Arc<SessionStore>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let index = warp::path::end()
        .and(warp::get())
        .and(with_auth(sessions.clone()))
        .and(with_broker(broker.clone()))
        .and_then(index_handler);

    let history = warp::path!("history")
        .and(warp::get())
        .and(with_auth(sessions.clone()))
        .and(with_broker(broker.clone()))
        .and_then(history_handler);

    let quote_form = warp::path!("quote")
        .and(warp::get())
        .and(with_auth(sessions.clone()))
        .map(|_ctx: Context| form_descriptor("quote", &["symbol"]));
    let quote = warp::path!("quote")
        .and(warp::post())
        .and(with_auth(sessions.clone()))
        .and(with_broker(broker.clone()))
        .and(form_body::<QuoteForm>())
        .and_then(quote_handler);

    let buy_form = warp::path!("buy")
        .and(warp::get())
        .and(with_auth(sessions.clone()))
        .map(|_ctx: Context| form_descriptor("buy", &["symbol", "shares"]));
    let buy = warp::path!("buy")
        .and(warp::post())
        .and(with_auth(sessions.clone()))
        .and(with_broker(broker.clone()))
        .and(form_body::<TradeForm>())
        .and_then(buy_handler);

    let sell_form = warp::path!("sell")
        .and(warp::get())
        .and(with_auth(sessions.clone()))
        .and(with_broker(broker.clone()))
        .and_then(sell_form_handler);
    let sell = warp::path!("sell")
        .and(warp::post())
        .and(with_auth(sessions.clone()))
        .and(with_broker(broker.clone()))
        .and(form_body::<TradeForm>())
        .and_then(sell_handler);

    let funding_form = warp::path!("funding")
        .and(warp::get())
        .and(with_auth(sessions.clone()))
        .and(with_broker(broker.clone()))
        .and_then(funding_form_handler);
    let funding = warp::path!("funding")
        .and(warp::post())
        .and(with_auth(sessions.clone()))
        .and(with_broker(broker.clone()))
        .and(form_body::<FundingForm>())
        .and_then(funding_handler);

    let login_form = warp::path!("login")
        .and(warp::get())
        .and(session_cookie())
        .and(with_accounts(accounts.clone()))
        .and_then(login_form_handler);
    let login = warp::path!("login")
        .and(warp::post())
        .and(session_cookie())
        .and(with_accounts(accounts.clone()))
        .and(form_body::<LoginForm>())
        .and_then(login_handler);

    let register_form = warp::path!("register")
        .and(warp::get())
        .map(|| form_descriptor("register", &["username", "password", "confirm"]));
    let register = warp::path!("register")
        .and(warp::post())
        .and(with_accounts(accounts.clone()))
        .and(form_body::<RegisterForm>())
        .and_then(register_handler);

    let logout = warp::path!("logout")
        .and(warp::get())
        .and(session_cookie())
        .and(with_accounts(accounts))
        .and_then(logout_handler);

    index
        .or(history)
        .or(quote_form)
        .or(quote)
        .or(buy_form)
        .or(buy)
        .or(sell_form)
        .or(sell)
        .or(funding_form)
        .or(funding)
        .or(login_form)
        .or(login)
        .or(register_form)
        .or(register)
        .or(logout)
        .recover(handle_rejection)
        .with(warp::reply::with::headers(no_cache_headers()))
        .with(warp::log("stock_trader::api"))
}

fn with_broker(
    broker: Arc<Broker>,
) -> impl Filter<Extract = (Arc<Broker>,), Error = Infallible> + Clone {
    warp::any().map(move || broker.clone())
}

fn with_accounts(
    accounts: Arc<Accounts>,
) -> impl Filter<Extract = (Arc<Accounts>,), Error = Infallible> + Clone {
    warp::any().map(move || accounts.clone())
}

fn session_cookie() -> impl Filter<Extract = (Option<String>,), Error = Infallible> + Clone {
    warp::cookie::optional::<String>(SESSION_COOKIE)
}

/// Resolves the session cookie into a request [`Context`], or rejects with
/// `AuthRequired`.
fn with_auth(
    sessions: Arc<SessionStore>,
) -> impl Filter<Extract = (Context,), Error = Rejection> + Clone {
    session_cookie().and_then(move |token: Option<String>| {
        let sessions = sessions.clone();
        async move {
            let ctx = match token {
                Some(token) => sessions.resolve(&token).await,
                None => None,
            };
            ctx.ok_or_else(|| warp::reject::custom(AppError::AuthRequired))
        }
    })
}

fn form_body<T: DeserializeOwned + Send>(
) -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_FORM_BYTES).and(warp::body::form())
}

fn no_cache_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers
}

fn form_descriptor(form: &str, fields: &[&str]) -> warp::reply::Json {
    warp::reply::json(&json!({ "form": form, "fields": fields }))
}

fn reject(e: AppError) -> Rejection {
    if e.is_internal() {
        error!("Request failed: {}", e);
    } else {
        warn!("Request refused: {}", e);
    }
    warp::reject::custom(e)
}

fn session_cookie_header(token: &str, max_age: i64) -> String {
    format!(
        "{}={}; HttpOnly; Path=/; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE, token, max_age
    )
}

fn with_session_cookie(reply: impl Reply, session: &Session, max_age: i64) -> Response {
    warp::reply::with_header(
        reply,
        header::SET_COOKIE,
        session_cookie_header(&session.token, max_age),
    )
    .into_response()
}

fn clear_session_cookie(reply: impl Reply) -> Response {
    warp::reply::with_header(reply, header::SET_COOKIE, session_cookie_header("", 0))
        .into_response()
}

async fn index_handler(ctx: Context, broker: Arc<Broker>) -> Result<Response, Rejection> {
    let view = broker.portfolio(&ctx).await.map_err(reject)?;
    Ok(warp::reply::json(&view).into_response())
}

async fn history_handler(ctx: Context, broker: Arc<Broker>) -> Result<Response, Rejection> {
    let rows = broker.history(&ctx).await.map_err(reject)?;
    Ok(warp::reply::json(&json!({ "rows": rows })).into_response())
}

async fn quote_handler(
    _ctx: Context,
    broker: Arc<Broker>,
    form: QuoteForm,
) -> Result<Response, Rejection> {
    let quote = broker.quote(form.symbol.as_deref()).await.map_err(reject)?;
    Ok(warp::reply::json(&json!({ "stock": quote })).into_response())
}

async fn buy_handler(
    ctx: Context,
    broker: Arc<Broker>,
    form: TradeForm,
) -> Result<Response, Rejection> {
    let receipt = broker
        .buy(&ctx, form.symbol.as_deref(), form.shares.as_deref())
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&json!({ "message": "Shares bought!", "trade": receipt })).into_response())
}

async fn sell_form_handler(ctx: Context, broker: Arc<Broker>) -> Result<Response, Rejection> {
    let owned = broker.owned_symbols(&ctx).await.map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "form": "sell",
        "fields": ["symbol", "shares"],
        "owned": owned,
    }))
    .into_response())
}

async fn sell_handler(
    ctx: Context,
    broker: Arc<Broker>,
    form: TradeForm,
) -> Result<Response, Rejection> {
    let receipt = broker
        .sell(&ctx, form.symbol.as_deref(), form.shares.as_deref())
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&json!({ "message": "Shares sold!", "trade": receipt })).into_response())
}

async fn funding_form_handler(ctx: Context, broker: Arc<Broker>) -> Result<Response, Rejection> {
    let cash = broker.cash(&ctx).await.map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "form": "funding",
        "fields": ["deposit", "withdrawal"],
        "cash": cash,
    }))
    .into_response())
}

async fn funding_handler(
    ctx: Context,
    broker: Arc<Broker>,
    form: FundingForm,
) -> Result<Response, Rejection> {
    let (message, cash) = if form.deposit_submit.is_some() {
        let (amount, cash) = broker
            .deposit(&ctx, form.deposit.as_deref())
            .await
            .map_err(reject)?;
        (format!("{} Deposited!", usd(amount)), cash)
    } else if form.withdrawal_submit.is_some() {
        let (amount, cash) = broker
            .withdraw(&ctx, form.withdrawal.as_deref())
            .await
            .map_err(reject)?;
        (format!("{} Withdrawn!", usd(amount)), cash)
    } else {
        return Err(reject(AppError::Validation(
            "choose deposit or withdrawal".to_string(),
        )));
    };
    Ok(warp::reply::json(&json!({ "message": message, "cash": cash })).into_response())
}

async fn login_form_handler(
    token: Option<String>,
    accounts: Arc<Accounts>,
) -> Result<Response, Rejection> {
    accounts.logout(token.as_deref()).await;
    Ok(clear_session_cookie(form_descriptor(
        "login",
        &["username", "password"],
    )))
}

async fn login_handler(
    token: Option<String>,
    accounts: Arc<Accounts>,
    form: LoginForm,
) -> Result<Response, Rejection> {
    accounts.logout(token.as_deref()).await;
    let session = accounts.login(form).await.map_err(reject)?;
    let body = warp::reply::json(&json!({ "message": "Logged in" }));
    Ok(with_session_cookie(body, &session, accounts.session_ttl_secs()))
}

async fn register_handler(
    accounts: Arc<Accounts>,
    form: RegisterForm,
) -> Result<Response, Rejection> {
    let session = accounts.register(form).await.map_err(reject)?;
    let body = warp::reply::with_status(
        warp::reply::json(&json!({ "message": "Registration successful. Logged in" })),
        StatusCode::CREATED,
    );
    Ok(with_session_cookie(body, &session, accounts.session_ttl_secs()))
}

async fn logout_handler(
    token: Option<String>,
    accounts: Arc<Accounts>,
) -> Result<Response, Rejection> {
    accounts.logout(token.as_deref()).await;
    info!("Logged out");
    Ok(clear_session_cookie(warp::redirect::see_other(
        Uri::from_static("/login"),
    )))
}

fn apology(status: StatusCode, kind: &str, message: &str) -> Response {
    warp::reply::with_status(
        warp::reply::json(&json!({ "error": kind, "message": message })),
        status,
    )
    .into_response()
}

/// Renders every rejection as an apology; a missing session becomes a
/// redirect to the login page.
pub async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    if let Some(e) = err.find::<AppError>() {
        if matches!(e, AppError::AuthRequired) {
            return Ok(warp::redirect::see_other(Uri::from_static("/login")).into_response());
        }
        return Ok(apology(e.status(), e.kind(), &e.public_message()));
    }

    if err.is_not_found() {
        return Ok(apology(StatusCode::NOT_FOUND, "not_found", "page not found"));
    }
    if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(apology(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            "method not allowed",
        ));
    }
    if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        return Ok(apology(
            StatusCode::PAYLOAD_TOO_LARGE,
            "validation",
            "form too large",
        ));
    }
    if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        return Ok(apology(StatusCode::BAD_REQUEST, "validation", &e.to_string()));
    }
    if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        return Ok(apology(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "validation",
            "expected a form body",
        ));
    }

    error!("Unhandled rejection: {:?}", err);
    Ok(apology(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        "internal error, please try again",
    ))
}
