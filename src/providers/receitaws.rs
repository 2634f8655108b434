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
use crate::provider::{Activity, Address, CompanyData, Partner, Provider, ProviderOutcome};

const BASE_URL: &str = "https://receitaws.com.br/v1/cnpj";

/// Client for the free ReceitaWS endpoint.
///
/// ReceitaWS answers 200 even for unknown CNPJs, flagging them with
/// `status: "ERROR"` in the body instead.
pub struct ReceitaWs {
    client: Client,
    base_url: String,
}

impl ReceitaWs {
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

impl Provider for ReceitaWs {
    fn name(&self) -> &'static str {
        "receitaws"
    }

    fn query<'a>(&'a self, cnpj: &'a Cnpj) -> BoxFuture<'a, ProviderOutcome> {
        async move {
            let url = format!("{}/{}", self.base_url, cnpj);
            debug!(%cnpj, url, "Querying ReceitaWS");

            let response = match self.client.get(&url).send().await {
                Ok(response) => response,
                Err(error) => return outcome_for_transport_error(&error),
            };

            // ReceitaWS uses 504 for "not in our database yet"; treat it
            // like any other transient error and let another provider try.
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
struct ReceitaWsBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    nome: Option<String>,
    #[serde(default)]
    fantasia: Option<String>,
    #[serde(default)]
    situacao: Option<String>,
    #[serde(default)]
    logradouro: Option<String>,
    #[serde(default)]
    numero: Option<String>,
    #[serde(default)]
    complemento: Option<String>,
    #[serde(default)]
    municipio: Option<String>,
    #[serde(default)]
    uf: Option<String>,
    #[serde(default)]
    cep: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    telefone: Option<String>,
    #[serde(default)]
    simples: Option<ReceitaWsSimples>,
    #[serde(default)]
    qsa: Vec<ReceitaWsPartner>,
    #[serde(default)]
    atividade_principal: Vec<ReceitaWsActivity>,
    #[serde(default)]
    atividades_secundarias: Vec<ReceitaWsActivity>,
}

#[derive(Debug, Deserialize)]
struct ReceitaWsSimples {
    #[serde(default)]
    optante: Option<bool>,
    #[serde(default)]
    data_opcao: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReceitaWsPartner {
    #[serde(default)]
    nome: String,
    #[serde(default)]
    qual: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReceitaWsActivity {
    #[serde(default)]
    code: String,
    #[serde(default)]
    text: String,
}

fn map_response(raw: Value) -> ProviderOutcome {
    let body: ReceitaWsBody = match serde_json::from_value(raw.clone()) {
        Ok(body) => body,
        Err(error) => {
            return ProviderOutcome::TransientError(format!("unexpected payload shape: {error}"))
        }
    };

    if body.status.as_deref() != Some("OK") {
        debug!(message = ?body.message, "ReceitaWS answered without data");
        return ProviderOutcome::NotFound;
    }

    let simples_flag = body.simples.as_ref().and_then(|s| s.optante);
    let simples_since = body
        .simples
        .as_ref()
        .and_then(|s| s.data_opcao.as_deref())
        .and_then(parse_provider_date);

    let zip_code = non_empty(body.cep).map(|cep| {
        cep.chars()
            .filter(|c| c.is_ascii_digit())
            .collect::<String>()
    });

    ProviderOutcome::Ok(CompanyData {
        legal_name: non_empty(body.nome),
        trade_name: non_empty(body.fantasia),
        registration_status: non_empty(body.situacao),
        address: Address {
            street: non_empty(body.logradouro),
            number: non_empty(body.numero),
            details: non_empty(body.complemento),
            city: non_empty(body.municipio),
            state: non_empty(body.uf),
            zip_code,
        },
        email: non_empty(body.email),
        phone: non_empty(body.telefone),
        simples_nacional: simples_flag,
        simples_nacional_since: simples_since,
        main_activity: body
            .atividade_principal
            .into_iter()
            .next()
            .map(|a| Activity {
                code: a.code,
                text: a.text,
            }),
        side_activities: body
            .atividades_secundarias
            .into_iter()
            .map(|a| Activity {
                code: a.code,
                text: a.text,
            })
            .collect(),
        partners: body
            .qsa
            .into_iter()
            .map(|p| Partner {
                name: p.nome,
                role: p.qual,
            })
            .collect(),
        raw,
    })
}
