use std::{
    net::SocketAddr,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use anyhow::Context;
use axum::{
    async_trait,
    extract::{ConnectInfo, FromRef, FromRequestParts},
    http::{self, request},
};
use engage_api::{Actor, Policy, Uuid};

use crate::{db, Error};

pub const FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Clone, axum::extract::FromRef)]
pub struct AppState {
    pub db: PgPool,
    pub policy: Arc<Policy>,
    pub proxy: ProxyTrust,
}

/// Whether the server sits behind a reverse proxy whose forwarding header can
/// be believed
#[derive(Clone, Copy, Debug)]
pub struct ProxyTrust(pub bool);

#[derive(Clone)]
pub struct PgPool(sqlx::PgPool);

impl PgPool {
    pub fn new(pool: sqlx::PgPool) -> PgPool {
        PgPool(pool)
    }

    pub async fn acquire(&self) -> Result<PgConn, Error> {
        Ok(PgConn(
            self.0.acquire().await.context("acquiring db connection")?,
        ))
    }

    pub fn num_idle(&self) -> usize {
        self.0.num_idle()
    }
}

pub struct PgConn(sqlx::pool::PoolConnection<sqlx::Postgres>);

#[async_trait]
impl FromRequestParts<AppState> for PgConn {
    type Rejection = Error;

    async fn from_request_parts(
        _req: &mut request::Parts,
        state: &AppState,
    ) -> Result<PgConn, Error> {
        state.db.acquire().await
    }
}

impl Deref for PgConn {
    type Target = sqlx::PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PgConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// A syntactically valid bearer token, not yet checked against the sessions
pub struct PreAuth(pub Uuid);

#[async_trait]
impl<S: Sync> FromRequestParts<S> for PreAuth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, _state: &S) -> Result<PreAuth, Error> {
        match req.headers.get(http::header::AUTHORIZATION) {
            None => Err(Error::permission_denied()),
            Some(auth) => {
                let auth = auth.to_str().map_err(|_| Error::permission_denied())?;
                let mut auth = auth.split(' ');
                if !auth
                    .next()
                    .ok_or(Error::permission_denied())?
                    .eq_ignore_ascii_case("bearer")
                {
                    return Err(Error::permission_denied());
                }
                let token = auth.next().ok_or(Error::permission_denied())?;
                if !auth.next().is_none() {
                    return Err(Error::permission_denied());
                }
                let token = Uuid::try_from(token).map_err(|_| Error::permission_denied())?;
                Ok(PreAuth(token))
            }
        }
    }
}

/// The signed-in actor, or `None` for anonymous requests
///
/// A request that does carry credentials must carry valid ones: a bad token is
/// refused rather than downgraded to anonymous.
pub struct MaybeActor(pub Option<Actor>);

#[async_trait]
impl FromRequestParts<AppState> for MaybeActor {
    type Rejection = Error;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &AppState,
    ) -> Result<MaybeActor, Error> {
        if !req.headers.contains_key(http::header::AUTHORIZATION) {
            return Ok(MaybeActor(None));
        }
        let token = PreAuth::from_request_parts(req, state).await?.0;
        let mut conn = PgConn::from_request_parts(req, state).await?;
        match db::recover_actor(&mut *conn, token).await? {
            Some(actor) => Ok(MaybeActor(Some(actor))),
            None => Err(Error::permission_denied()),
        }
    }
}

/// Raw network address of the client, to be hashed and then forgotten
///
/// Behind a trusted proxy this is the last `X-Forwarded-For` entry, the one the
/// proxy appended. Earlier entries are written by the client and ignored.
pub struct ClientAddr(pub Option<String>);

impl ClientAddr {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientAddr
where
    S: Sync,
    ProxyTrust: FromRef<S>,
{
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, state: &S) -> Result<ClientAddr, Error> {
        if ProxyTrust::from_ref(state).0 {
            let proxy_hop = req
                .headers
                .get(FORWARDED_FOR)
                .and_then(|h| h.to_str().ok())
                .and_then(|h| h.rsplit(',').next())
                .map(str::trim)
                .filter(|h| !h.is_empty());
            if let Some(addr) = proxy_hop {
                return Ok(ClientAddr(Some(String::from(addr))));
            }
        }
        Ok(ClientAddr(
            req.extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string()),
        ))
    }
}
