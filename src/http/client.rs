use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{Request, Response};

use super::Error;

/// Generic HTTP client trait
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Client: Send + Sync + fmt::Debug {
    async fn execute(&self, req: Request) -> Result<Response, reqwest::Error>;
}

/// HTTP client options
#[derive(Debug, Clone)]
pub struct Options {
    pub timeout_connect: Duration,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout_connect: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

#[derive(Debug)]
pub struct ReqwestClient(reqwest::Client);

impl ReqwestClient {
    pub fn new(opts: Options) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(opts.timeout_connect)
            .timeout(opts.timeout)
            .user_agent(opts.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self(client))
    }
}

#[async_trait]
impl Client for ReqwestClient {
    async fn execute(&self, req: Request) -> Result<Response, reqwest::Error> {
        self.0.execute(req).await
    }
}
