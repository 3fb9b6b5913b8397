//! Token wallet: balance, top-up plans and crypto invoices.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    domain::UserId,
    errors::Error,
    store::{Invoice, InvoiceStatus, Store, User},
    utils::unix_now,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Plan {
    pub tokens: i64,
    /// Price in USD, as sent to the payment gateway.
    pub price: &'static str,
}

pub const PLANS: [Plan; 3] = [
    Plan {
        tokens: 10_000,
        price: "3.99",
    },
    Plan {
        tokens: 25_000,
        price: "8.99",
    },
    Plan {
        tokens: 50_000,
        price: "14.99",
    },
];

/// Invoice as reported by the payment gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteInvoice {
    pub invoice_id: i64,
    /// `active`, `paid` or `expired`.
    pub status: String,
    pub pay_url: String,
    pub amount: String,
    pub asset: String,
}

/// Port over the crypto payment gateway.
#[async_trait]
pub trait PaymentsApi: Send + Sync {
    async fn create_invoice(
        &self,
        asset: &str,
        amount: &str,
        description: &str,
        payload: &str,
    ) -> Result<RemoteInvoice>;

    async fn get_invoice(&self, invoice_id: i64) -> Result<Option<RemoteInvoice>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvoiceCheck {
    Paid { credited: i64, balance: i64 },
    AlreadyCredited,
    Pending,
    Expired,
}

pub struct WalletService {
    store: Arc<Store>,
    payments: Option<Arc<dyn PaymentsApi>>,
    asset: String,
}

impl WalletService {
    pub fn new(store: Arc<Store>, payments: Option<Arc<dyn PaymentsApi>>, asset: &str) -> Self {
        Self {
            store,
            payments,
            asset: asset.to_string(),
        }
    }

    pub fn payments_enabled(&self) -> bool {
        self.payments.is_some()
    }

    pub fn plans(&self) -> &'static [Plan] {
        &PLANS
    }

    pub fn account(&self, user: UserId) -> Result<User> {
        self.store
            .get_user(user)?
            .ok_or_else(|| Error::NotFound(format!("user {}", user.0)))
    }

    fn gateway(&self) -> Result<&dyn PaymentsApi> {
        self.payments
            .as_deref()
            .ok_or_else(|| Error::Config("payments are not configured".to_string()))
    }

    /// Open an invoice for plan `plan_index` and remember it locally.
    pub async fn create_topup(&self, user: UserId, plan_index: usize) -> Result<Invoice> {
        let plan = PLANS
            .get(plan_index)
            .ok_or_else(|| Error::InvalidInput(format!("unknown plan {plan_index}")))?;
        let gateway = self.gateway()?;

        let remote = gateway
            .create_invoice(
                &self.asset,
                plan.price,
                &format!("{} tokens for the assistant bot", plan.tokens),
                &format!("topup:{}:{plan_index}", user.0),
            )
            .await?;

        let invoice = Invoice {
            invoice_id: remote.invoice_id,
            user_id: user,
            plan_index,
            tokens: plan.tokens,
            amount: remote.amount,
            asset: remote.asset,
            pay_url: remote.pay_url,
            status: InvoiceStatus::Active,
            created_at: unix_now(),
        };
        self.store.insert_invoice(&invoice)?;
        tracing::info!(user_id = user.0, invoice_id = invoice.invoice_id, "top-up invoice created");
        Ok(invoice)
    }

    /// Ask the gateway about an invoice and credit it on the first `paid`.
    pub async fn check_invoice(&self, user: UserId, invoice_id: i64) -> Result<InvoiceCheck> {
        let local = self
            .store
            .get_invoice(invoice_id)?
            .ok_or_else(|| Error::NotFound(format!("invoice {invoice_id}")))?;
        if local.user_id != user {
            return Err(Error::Forbidden(format!("invoice {invoice_id}")));
        }
        match local.status {
            InvoiceStatus::Paid => return Ok(InvoiceCheck::AlreadyCredited),
            InvoiceStatus::Expired => return Ok(InvoiceCheck::Expired),
            InvoiceStatus::Active => {}
        }

        let remote = self
            .gateway()?
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("invoice {invoice_id}")))?;

        match remote.status.as_str() {
            "paid" => {
                if !self.store.mark_invoice_paid(invoice_id)? {
                    return Ok(InvoiceCheck::AlreadyCredited);
                }
                let balance = self.account(user)?.balance;
                tracing::info!(user_id = user.0, invoice_id, tokens = local.tokens, "invoice credited");
                Ok(InvoiceCheck::Paid {
                    credited: local.tokens,
                    balance,
                })
            }
            "expired" => {
                self.store.mark_invoice_expired(invoice_id)?;
                Ok(InvoiceCheck::Expired)
            }
            _ => Ok(InvoiceCheck::Pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePayments;

    fn wallet() -> (WalletService, Arc<Store>, Arc<FakePayments>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.ensure_user(UserId(1), "Ann", 100).unwrap();
        store.ensure_user(UserId(2), "Bob", 0).unwrap();
        let payments = Arc::new(FakePayments::new());
        let wallet = WalletService::new(store.clone(), Some(payments.clone()), "USDT");
        (wallet, store, payments)
    }

    #[tokio::test]
    async fn topup_is_credited_exactly_once() {
        let (wallet, store, payments) = wallet();
        let invoice = wallet.create_topup(UserId(1), 1).await.unwrap();
        assert_eq!(invoice.tokens, 25_000);
        assert_eq!(invoice.amount, "8.99");
        assert_eq!(payments.payloads(), vec!["topup:1:1"]);
        assert_eq!(
            store.get_invoice(invoice.invoice_id).unwrap().unwrap().status,
            InvoiceStatus::Active
        );

        assert_eq!(
            wallet.check_invoice(UserId(1), invoice.invoice_id).await.unwrap(),
            InvoiceCheck::Pending
        );

        payments.set_status(invoice.invoice_id, "paid");
        assert_eq!(
            wallet.check_invoice(UserId(1), invoice.invoice_id).await.unwrap(),
            InvoiceCheck::Paid {
                credited: 25_000,
                balance: 25_100
            }
        );
        assert_eq!(
            wallet.check_invoice(UserId(1), invoice.invoice_id).await.unwrap(),
            InvoiceCheck::AlreadyCredited
        );
        assert_eq!(wallet.account(UserId(1)).unwrap().balance, 25_100);
    }

    #[tokio::test]
    async fn only_the_owner_can_check() {
        let (wallet, _, payments) = wallet();
        let invoice = wallet.create_topup(UserId(1), 0).await.unwrap();
        payments.set_status(invoice.invoice_id, "paid");
        assert!(matches!(
            wallet.check_invoice(UserId(2), invoice.invoice_id).await,
            Err(Error::Forbidden(_))
        ));
        assert_eq!(wallet.account(UserId(2)).unwrap().balance, 0);
    }

    #[tokio::test]
    async fn expired_and_invalid_plans() {
        let (wallet, store, payments) = wallet();
        assert!(matches!(
            wallet.create_topup(UserId(1), PLANS.len()).await,
            Err(Error::InvalidInput(_))
        ));

        let invoice = wallet.create_topup(UserId(1), 2).await.unwrap();
        payments.set_status(invoice.invoice_id, "expired");
        assert_eq!(
            wallet.check_invoice(UserId(1), invoice.invoice_id).await.unwrap(),
            InvoiceCheck::Expired
        );
        assert_eq!(
            store.get_invoice(invoice.invoice_id).unwrap().unwrap().status,
            InvoiceStatus::Expired
        );
    }

    #[tokio::test]
    async fn disabled_payments_are_reported() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.ensure_user(UserId(1), "Ann", 0).unwrap();
        let wallet = WalletService::new(store, None, "USDT");
        assert!(!wallet.payments_enabled());
        assert!(matches!(
            wallet.create_topup(UserId(1), 0).await,
            Err(Error::Config(_))
        ));
    }
}
