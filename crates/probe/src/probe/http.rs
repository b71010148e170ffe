use std::time::Instant;

use async_trait::async_trait;
use reqwest::{Method, redirect};
use tracing::debug;
use url::Url;

use crate::address::{Scheme, Separator, replace_scheme};
use crate::context::ProbeContext;
use crate::error::ProbeError;
use crate::probe::{HTTP_TIMEOUT, Prober, report_single};
use crate::record::{Record, Status};
use crate::reporter::Reporter;
use crate::util::error_chain;

const MAX_REDIRECTS: usize = 10;
const REDIRECT_LOOP: &str = "redirect loop detected";

fn redirect_policy() -> redirect::Policy {
    redirect::Policy::custom(|attempt| {
        if attempt.previous().len() > MAX_REDIRECTS || attempt.previous().contains(attempt.url()) {
            attempt.error(REDIRECT_LOOP)
        } else {
            attempt.follow()
        }
    })
}

fn parse_method(variant: &str) -> Option<Method> {
    match variant.to_ascii_lowercase().as_str() {
        "" | "get" => Some(Method::GET),
        "head" => Some(Method::HEAD),
        "post" => Some(Method::POST),
        "options" => Some(Method::OPTIONS),
        "connect" => Some(Method::CONNECT),
        _ => None,
    }
}

/// Checks that an HTTP(S) endpoint answers with a 2xx or 3xx status.
pub struct HttpProbe {
    target: Url,
    request_url: Url,
    method: Method,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(target: Url) -> Result<Self, ProbeError> {
        let scheme = target.scheme().to_string();
        let parsed = Scheme::parse(&scheme);
        let variant = parsed.variant_for(Separator::Mode, &scheme)?;
        let method =
            parse_method(variant).ok_or_else(|| ProbeError::UnsupportedScheme(scheme.clone()))?;

        if target.host_str().is_none_or(str::is_empty) {
            return Err(ProbeError::MissingHost);
        }

        let mut request_url = replace_scheme(&target, parsed.base)?;
        request_url.set_fragment(None);

        let client = reqwest::Client::builder()
            .redirect(redirect_policy())
            .user_agent(concat!("ayd-probe/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { target, request_url, method, client })
    }

    async fn check(&self) -> Record {
        let record = Record::new(self.target.clone(), Status::Failure);
        let started = Instant::now();

        let request = self.client.request(self.method.clone(), self.request_url.clone());
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let latency = started.elapsed();
                debug!(url = %self.request_url, error = %e, "http request failed");
                return classify_error(record.with_latency(latency), &e);
            }
        };

        let status = response.status();
        let proto = format!("{:?}", response.version());
        let body = response.bytes().await;
        let latency = started.elapsed();

        let record = record
            .with_latency(latency)
            .with_extra("proto", proto)
            .with_extra("status_code", status.as_u16());

        let record = match body {
            Ok(body) => record.with_extra("length", body.len()),
            Err(e) => {
                return record.with_message(format!("failed to read body: {}", error_chain(&e)));
            }
        };

        let message = match status.canonical_reason() {
            Some(reason) => format!("{} {}", status.as_u16(), reason),
            None => status.as_u16().to_string(),
        };

        if status.is_success() || status.is_redirection() {
            record.with_status(Status::Healthy).with_message(message)
        } else {
            record.with_message(message)
        }
    }
}

fn classify_error(record: Record, err: &reqwest::Error) -> Record {
    if err.is_redirect() {
        return record.with_message(REDIRECT_LOOP);
    }

    let chain = error_chain(err);
    if is_dns_error(&chain) {
        return record.with_status(Status::Unknown).with_message(chain);
    }
    if err.is_timeout() {
        return record.with_message("probe timed out");
    }
    record.with_message(chain)
}

fn is_dns_error(chain: &str) -> bool {
    let lower = chain.to_ascii_lowercase();
    ["dns error", "failed to lookup address", "name or service not known"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[async_trait]
impl Prober for HttpProbe {
    fn target(&self) -> &Url {
        &self.target
    }

    async fn probe(&self, ctx: &ProbeContext, reporter: &dyn Reporter) {
        report_single(ctx, HTTP_TIMEOUT, &self.target, reporter, self.check()).await;
    }
}
