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
use crate::provider::{Address, CompanyData, Provider, ProviderOutcome};

const BASE_URL: &str = "https://publica.cnpj.ws/cnpj";

/// Client for the public CNPJ.ws endpoint.
pub struct CnpjWs {
    client: Client,
    base_url: String,
}

impl CnpjWs {
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

impl Provider for CnpjWs {
    fn name(&self) -> &'static str {
        "cnpjws"
    }

    fn query<'a>(&'a self, cnpj: &'a Cnpj) -> BoxFuture<'a, ProviderOutcome> {
        async move {
            let url = format!("{}/{}", self.base_url, cnpj);
            debug!(%cnpj, url, "Querying CNPJ.ws");

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
struct CnpjWsBody {
    #[serde(default)]
    razao_social: Option<String>,
    #[serde(default)]
    estabelecimento: Option<CnpjWsEstablishment>,
    #[serde(default)]
    simples: Option<CnpjWsSimples>,
}

#[derive(Debug, Default, Deserialize)]
struct CnpjWsEstablishment {
    #[serde(default)]
    nome_fantasia: Option<String>,
    #[serde(default)]
    situacao_cadastral: Option<String>,
    #[serde(default)]
    logradouro: Option<String>,
    #[serde(default)]
    numero: Option<String>,
    #[serde(default)]
    complemento: Option<String>,
    #[serde(default)]
    cep: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    ddd1: Option<String>,
    #[serde(default)]
    telefone1: Option<String>,
    #[serde(default)]
    cidade: Option<CnpjWsNamed>,
    #[serde(default)]
    estado: Option<CnpjWsState>,
}

#[derive(Debug, Deserialize)]
struct CnpjWsNamed {
    #[serde(default)]
    nome: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CnpjWsState {
    #[serde(default)]
    sigla: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CnpjWsSimples {
    #[serde(default)]
    simples: Option<String>,
    #[serde(default)]
    data_opcao_simples: Option<String>,
}

fn map_response(raw: Value) -> ProviderOutcome {
    let body: CnpjWsBody = match serde_json::from_value(raw.clone()) {
        Ok(body) => body,
        Err(error) => {
            return ProviderOutcome::TransientError(format!("unexpected payload shape: {error}"))
        }
    };

    let establishment = body.estabelecimento.unwrap_or_default();

    // CNPJ.ws reports the Simples option as "Sim"/"Não" text.
    let simples_flag = body
        .simples
        .as_ref()
        .and_then(|s| s.simples.as_deref())
        .map(|answer| answer.eq_ignore_ascii_case("sim"));
    let simples_since = body
        .simples
        .as_ref()
        .and_then(|s| s.data_opcao_simples.as_deref())
        .and_then(parse_provider_date);

    let phone = match (
        non_empty(establishment.ddd1),
        non_empty(establishment.telefone1),
    ) {
        (Some(ddd), Some(number)) => Some(format!("{ddd}{number}")),
        (None, Some(number)) => Some(number),
        _ => None,
    };

    let zip_code = non_empty(establishment.cep).map(|cep| {
        cep.chars()
            .filter(|c| c.is_ascii_digit())
            .collect::<String>()
    });

    ProviderOutcome::Ok(CompanyData {
        legal_name: non_empty(body.razao_social),
        trade_name: non_empty(establishment.nome_fantasia),
        registration_status: non_empty(establishment.situacao_cadastral),
        address: Address {
            street: non_empty(establishment.logradouro),
            number: non_empty(establishment.numero),
            details: non_empty(establishment.complemento),
            city: establishment.cidade.and_then(|c| non_empty(c.nome)),
            state: establishment.estado.and_then(|s| non_empty(s.sigla)),
            zip_code,
        },
        email: non_empty(establishment.email),
        phone,
        simples_nacional: simples_flag,
        simples_nacional_since: simples_since,
        main_activity: None,
        side_activities: Vec::new(),
        partners: Vec::new(),
        raw,
    })
}
