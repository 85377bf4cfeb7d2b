//! Account helpers: credit balance, daily credit and token liveness.

use serde::Serialize;
use serde_json::{json, Value};

use super::{ApiCall, ControlPlane, ACCOUNT_INFO_URI, CREDIT_RECEIVE_URI, USER_CREDIT_URI};
use crate::error::{JimengError, Result};

const CREDIT_REFERER: &str = "https://jimeng.jianying.com/ai-tool/image/generate";

/// Credit balance split by source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Credit {
    /// Free credit
    pub gift_credit: i64,
    /// Bought credit
    pub purchase_credit: i64,
    /// Membership credit
    pub vip_credit: i64,
}

impl Credit {
    /// Sum of all sources.
    pub fn total(&self) -> i64 {
        self.gift_credit + self.purchase_credit + self.vip_credit
    }

    fn from_data(data: &Value) -> Result<Self> {
        let credit = data
            .get("credit")
            .ok_or_else(|| JimengError::UpstreamCallFailed("credit info missing".to_string()))?;
        let field = |name: &str| credit.get(name).and_then(Value::as_i64).unwrap_or(0);
        Ok(Self {
            gift_credit: field("gift_credit"),
            purchase_credit: field("purchase_credit"),
            vip_credit: field("vip_credit"),
        })
    }
}

/// Read the current balance.
pub async fn get_credit(control: &dyn ControlPlane) -> Result<Credit> {
    let data = control
        .call(ApiCall::post(USER_CREDIT_URI, json!({})).with_referer(CREDIT_REFERER))
        .await?;
    let credit = Credit::from_data(&data)?;
    tracing::info!(
        gift = credit.gift_credit,
        purchase = credit.purchase_credit,
        vip = credit.vip_credit,
        "credit balance"
    );
    Ok(credit)
}

/// Claim today's free credit. Returns the new total.
pub async fn receive_credit(control: &dyn ControlPlane) -> Result<i64> {
    tracing::info!("claiming daily credit");
    let data = control
        .call(
            ApiCall::post(CREDIT_RECEIVE_URI, json!({ "time_zone": "Asia/Shanghai" }))
                .with_referer(CREDIT_REFERER),
        )
        .await?;
    let total = data.get("cur_total_credits").and_then(Value::as_i64).unwrap_or(0);
    let quota = data.get("receive_quota").and_then(Value::as_i64).unwrap_or(0);
    tracing::info!(quota, total, "daily credit claimed");
    Ok(total)
}

/// Read the balance and claim the daily credit when it is exhausted.
pub async fn ensure_credit(control: &dyn ControlPlane) -> Result<Credit> {
    let credit = get_credit(control).await?;
    if credit.total() <= 0 {
        receive_credit(control).await?;
    }
    Ok(credit)
}

/// Whether the session token is still accepted upstream.
///
/// Envelope rejections mean a dead token; transport failures propagate.
pub async fn token_live(control: &dyn ControlPlane) -> Result<bool> {
    let call = ApiCall::post(ACCOUNT_INFO_URI, json!({}))
        .with_params(vec![("account_sdk_source".to_string(), "web".to_string())]);
    match control.call(call).await {
        Ok(data) => {
            let user_id = data
                .get("user_id")
                .or_else(|| data.get("data").and_then(|d| d.get("user_id")));
            Ok(user_id.is_some_and(|id| !id.is_null()))
        },
        Err(JimengError::InsufficientCredit(_)) => Ok(false),
        Err(JimengError::UpstreamCallFailed(msg)) if msg.starts_with("ret ") => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedControlPlane;

    #[tokio::test]
    async fn test_credit_total() {
        let control = ScriptedControlPlane::new().respond(
            USER_CREDIT_URI,
            json!({"credit": {"gift_credit": 10, "purchase_credit": 0, "vip_credit": 5}}),
        );
        let credit = get_credit(&control).await.unwrap();
        assert_eq!(credit.total(), 15);
    }

    #[tokio::test]
    async fn test_empty_balance_claims_daily_credit() {
        let control = ScriptedControlPlane::new()
            .respond(
                USER_CREDIT_URI,
                json!({"credit": {"gift_credit": 0, "purchase_credit": 0, "vip_credit": 0}}),
            )
            .respond(CREDIT_RECEIVE_URI, json!({"cur_total_credits": 66, "receive_quota": 66}));

        ensure_credit(&control).await.unwrap();
        assert_eq!(control.calls_to(CREDIT_RECEIVE_URI), 1);
        assert_eq!(
            control.bodies_to(CREDIT_RECEIVE_URI)[0]["time_zone"],
            "Asia/Shanghai"
        );
    }

    #[tokio::test]
    async fn test_positive_balance_skips_claim() {
        let control = ScriptedControlPlane::new().respond(
            USER_CREDIT_URI,
            json!({"credit": {"gift_credit": 1, "purchase_credit": 0, "vip_credit": 0}}),
        );
        ensure_credit(&control).await.unwrap();
        assert_eq!(control.calls_to(CREDIT_RECEIVE_URI), 0);
    }

    #[tokio::test]
    async fn test_token_live() {
        let live = ScriptedControlPlane::new().respond(ACCOUNT_INFO_URI, json!({"user_id": 123}));
        assert!(token_live(&live).await.unwrap());

        let dead = ScriptedControlPlane::new().fail(
            ACCOUNT_INFO_URI,
            JimengError::UpstreamCallFailed("ret 1015: not login".into()),
        );
        assert!(!token_live(&dead).await.unwrap());

        let unreachable = ScriptedControlPlane::new().fail(
            ACCOUNT_INFO_URI,
            JimengError::UpstreamCallFailed("connection reset".into()),
        );
        assert!(token_live(&unreachable).await.is_err());
    }
}
