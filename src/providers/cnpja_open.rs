use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{
    http_client, non_empty, outcome_for_status, outcome_for_transport_error, parse_provider_date,
};
use crate::cnpj::Cnpj;
use crate::provider::{Activity, Address, CompanyData, Provider, ProviderOutcome};

const BASE_URL: &str = "https://open.cnpja.com/office";

/// Client for the public CNPJa Open endpoint.
pub struct CnpjaOpen {
    client: Client,
    base_url: String,
}

impl CnpjaOpen {
    /// Build a client with the given hard request deadline.
    pub fn new(timeout: Duration) -> Self {
        Self::with_base_url(BASE_URL, timeout)
    }

    /// Build a client against a non-default endpoint (tests, proxies).
    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            base_url: base_url.into(),
        }
    }
}

impl Provider for CnpjaOpen {
    fn name(&self) -> &'static str {
        "cnpja_open"
    }

    fn query<'a>(&'a self, cnpj: &'a Cnpj) -> BoxFuture<'a, ProviderOutcome> {
        async move {
            let url = format!("{}/{}", self.base_url, cnpj);
            debug!(%cnpj, url, "Querying CNPJa Open");

            let response = match self.client.get(&url).send().await {
                Ok(response) => response,
                Err(error) => return outcome_for_transport_error(&error),
            };
            if response.status() != StatusCode::OK {
                return outcome_for_status(response.status());
            }

            let raw: Value = match response.json().await {
                Ok(raw) => raw,
                Err(error) => {
                    return ProviderOutcome::TransientError(format!("invalid payload: {error}"))
                }
            };
            map_response(raw)
        }
        .boxed()
    }
}

#[derive(Debug, Deserialize)]
struct CnpjaBody {
    #[serde(default)]
    company: Option<CnpjaCompany>,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    status: Option<CnpjaStatus>,
    #[serde(default)]
    address: Option<CnpjaAddress>,
    #[serde(default)]
    phones: Vec<CnpjaPhone>,
    #[serde(default)]
    emails: Vec<CnpjaEmail>,
    #[serde(default, rename = "mainActivity")]
    main_activity: Option<CnpjaActivity>,
    #[serde(default, rename = "sideActivities")]
    side_activities: Vec<CnpjaActivity>,
}

#[derive(Debug, Deserialize)]
struct CnpjaCompany {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    simples: Option<CnpjaSimples>,
}

#[derive(Debug, Deserialize)]
struct CnpjaSimples {
    #[serde(default)]
    optant: Option<bool>,
    #[serde(default)]
    since: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CnpjaStatus {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CnpjaAddress {
    #[serde(default)]
    street: Option<String>,
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    zip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CnpjaPhone {
    #[serde(default)]
    area: Option<String>,
    #[serde(default)]
    number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CnpjaEmail {
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CnpjaActivity {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    text: Option<String>,
}

impl CnpjaActivity {
    fn into_activity(self) -> Activity {
        Activity {
            code: self.id.map(|id| id.to_string()).unwrap_or_default(),
            text: self.text.unwrap_or_default(),
        }
    }
}

fn map_response(raw: Value) -> ProviderOutcome {
    let body: CnpjaBody = match serde_json::from_value(raw.clone()) {
        Ok(body) => body,
        Err(error) => {
            return ProviderOutcome::TransientError(format!("unexpected payload shape: {error}"))
        }
    };

    let simples = body.company.as_ref().and_then(|c| c.simples.as_ref());
    let simples_flag = simples.and_then(|s| s.optant);
    let simples_since = simples
        .and_then(|s| s.since.as_deref())
        .and_then(parse_provider_date);

    let address = body.address.unwrap_or_default();
    let zip_code = non_empty(address.zip).map(|zip| {
        zip.chars()
            .filter(|c| c.is_ascii_digit())
            .collect::<String>()
    });

    let email = body
        .emails
        .into_iter()
        .find_map(|e| non_empty(e.address));
    let phone = body.phones.into_iter().find_map(|p| {
        let number = non_empty(p.number)?;
        Some(match non_empty(p.area) {
            Some(area) => format!("{area}{number}"),
            None => number,
        })
    });

    ProviderOutcome::Ok(CompanyData {
        legal_name: body.company.and_then(|c| non_empty(c.name)),
        trade_name: non_empty(body.alias),
        registration_status: body.status.and_then(|s| non_empty(s.text)),
        address: Address {
            street: non_empty(address.street),
            number: non_empty(address.number),
            details: non_empty(address.details),
            city: non_empty(address.city),
            state: non_empty(address.state),
            zip_code,
        },
        email,
        phone,
        simples_nacional: simples_flag,
        simples_nacional_since: simples_since,
        main_activity: body.main_activity.map(CnpjaActivity::into_activity),
        side_activities: body
            .side_activities
            .into_iter()
            .map(CnpjaActivity::into_activity)
            .collect(),
        partners: Vec::new(),
        raw,
    })
}
