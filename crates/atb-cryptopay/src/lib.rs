//! Crypto Pay API adapter (invoices for token top-ups).

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;

use atb_core::{
    config::PayNetwork,
    errors::Error,
    wallet::{PaymentsApi, RemoteInvoice},
    Result,
};

#[derive(Clone, Debug)]
pub struct CryptoPayClient {
    token: String,
    base_url: String,
    http: reqwest::Client,
}

/// `{"ok": true, "result": ...}` or `{"ok": false, "error": {...}}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
pub struct AppInfo {
    pub app_id: i64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceBody {
    invoice_id: i64,
    status: String,
    #[serde(default)]
    bot_invoice_url: Option<String>,
    #[serde(default)]
    pay_url: Option<String>,
    #[serde(default)]
    amount: String,
    #[serde(default)]
    asset: Option<String>,
}

impl From<InvoiceBody> for RemoteInvoice {
    fn from(b: InvoiceBody) -> Self {
        RemoteInvoice {
            invoice_id: b.invoice_id,
            status: b.status,
            pay_url: b.bot_invoice_url.or(b.pay_url).unwrap_or_default(),
            amount: b.amount,
            asset: b.asset.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InvoiceList {
    #[serde(default)]
    items: Vec<InvoiceBody>,
}

fn unwrap_envelope<T: DeserializeOwned>(method: &str, body: &str) -> Result<T> {
    let env: Envelope<T> = serde_json::from_str(body)
        .map_err(|e| Error::External(format!("cryptopay {method}: bad response: {e}")))?;
    match (env.ok, env.result) {
        (true, Some(result)) => Ok(result),
        _ => {
            let (code, name) = env
                .error
                .map(|e| (e.code, e.name))
                .unwrap_or((0, "UNKNOWN".to_string()));
            Err(Error::External(format!("cryptopay {method} failed: {code} {name}")))
        }
    }
}

impl CryptoPayClient {
    pub fn new(token: impl Into<String>, network: PayNetwork) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::External(format!("cryptopay client build error: {e}")))?;
        Ok(Self {
            token: token.into(),
            base_url: format!("https://{}/api", network.hostname()),
            http,
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T> {
        let resp = self
            .http
            .post(format!("{}/{method}", self.base_url))
            .header("Crypto-Pay-API-Token", &self.token)
            .json(&params)
            .send()
            .await
            .map_err(|e| Error::External(format!("cryptopay request error: {e}")))?;
        let body = resp
            .text()
            .await
            .map_err(|e| Error::External(format!("cryptopay body error: {e}")))?;
        unwrap_envelope(method, &body)
    }

    /// Checks the token; used once at startup.
    pub async fn get_me(&self) -> Result<AppInfo> {
        self.call("getMe", json!({})).await
    }
}

#[async_trait]
impl PaymentsApi for CryptoPayClient {
    async fn create_invoice(
        &self,
        asset: &str,
        amount: &str,
        description: &str,
        payload: &str,
    ) -> Result<RemoteInvoice> {
        let body: InvoiceBody = self
            .call(
                "createInvoice",
                json!({
                    "currency_type": "crypto",
                    "asset": asset,
                    "amount": amount,
                    "description": description,
                    "payload": payload,
                }),
            )
            .await?;
        tracing::debug!(invoice_id = body.invoice_id, "cryptopay invoice created");
        Ok(body.into())
    }

    async fn get_invoice(&self, invoice_id: i64) -> Result<Option<RemoteInvoice>> {
        let list: InvoiceList = self
            .call("getInvoices", json!({ "invoice_ids": invoice_id.to_string() }))
            .await?;
        Ok(list
            .items
            .into_iter()
            .find(|i| i.invoice_id == invoice_id)
            .map(RemoteInvoice::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_envelope_prefers_bot_url() {
        let inv: InvoiceBody = unwrap_envelope(
            "createInvoice",
            r#"{"ok":true,"result":{"invoice_id":7,"status":"active","bot_invoice_url":"https://t.me/CryptoTestnetBot?start=IV7","pay_url":"old","amount":"3.99","asset":"USDT"}}"#,
        )
        .unwrap();
        let remote = RemoteInvoice::from(inv);
        assert_eq!(remote.invoice_id, 7);
        assert_eq!(remote.pay_url, "https://t.me/CryptoTestnetBot?start=IV7");
        assert_eq!(remote.asset, "USDT");
    }

    #[test]
    fn error_envelope_names_the_failure() {
        let err = unwrap_envelope::<InvoiceBody>(
            "createInvoice",
            r#"{"ok":false,"error":{"code":401,"name":"UNAUTHORIZED"}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("401 UNAUTHORIZED"));
        assert!(unwrap_envelope::<InvoiceBody>("getMe", "<html>").is_err());
    }

    #[test]
    fn invoice_list_tolerates_missing_items() {
        let list: InvoiceList = unwrap_envelope("getInvoices", r#"{"ok":true,"result":{}}"#).unwrap();
        assert!(list.items.is_empty());
    }

    #[test]
    fn network_selects_host() {
        let c = CryptoPayClient::new("t", PayNetwork::Mainnet).unwrap();
        assert_eq!(c.base_url, "https://pay.crypt.bot/api");
    }
}
