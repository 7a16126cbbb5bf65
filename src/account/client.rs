//! Account activity client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::account::AccountStatus;
use crate::config::AppConfig;
use crate::error::AccountError;

/// Default provider endpoint.
pub const DEFAULT_BASE_URL: &str = "https://www.tarsnap.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches the current account state.
#[async_trait]
pub trait AccountClient: Send + Sync {
    async fn fetch_status(&self) -> Result<AccountStatus, AccountError>;
}

/// Reads the provider's CSV activity report over HTTPS.
pub struct HttpAccountClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: SecretString,
    machine: Option<String>,
}

impl HttpAccountClient {
    pub fn new(
        base_url: impl Into<String>,
        user: impl Into<String>,
        password: SecretString,
        machine: Option<String>,
    ) -> Result<Self, AccountError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AccountError::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user: user.into(),
            password,
            machine,
        })
    }

    /// Build a client from the configured credentials.
    pub fn from_config(config: &AppConfig) -> Result<Self, AccountError> {
        match (&config.account_user, &config.account_password) {
            (Some(user), Some(password)) => Self::new(
                DEFAULT_BASE_URL,
                user.clone(),
                password.clone(),
                config.machine_name.clone(),
            ),
            _ => Err(AccountError::NoCredentials),
        }
    }
}

#[async_trait]
impl AccountClient for HttpAccountClient {
    async fn fetch_status(&self) -> Result<AccountStatus, AccountError> {
        let url = format!("{}/manage.cgi", self.base_url);
        debug!(%url, "Fetching account activity");

        let response = self
            .http
            .get(&url)
            .query(&[
                ("address", self.user.as_str()),
                ("password", self.password.expose_secret()),
                ("action", "verboseactivity"),
                ("format", "csv"),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AccountError::Timeout(REQUEST_TIMEOUT)
                } else {
                    AccountError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AccountError::Rejected {
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| AccountError::Request(e.to_string()))?;
        parse_activity_csv(&body, self.machine.as_deref())
    }
}

/// Parse the activity report.
///
/// The header names the columns; `RECTYPE`, `DATE` and `BALANCE` are required,
/// `MACHINE` is optional. The last `Balance` row gives the current credit.
/// When `machine` is set, the latest row mentioning it gives the last
/// activity date for this machine.
pub fn parse_activity_csv(body: &str, machine: Option<&str>) -> Result<AccountStatus, AccountError> {
    let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());
    let header = lines
        .next()
        .ok_or_else(|| AccountError::Parse("empty report".into()))?;
    if header.starts_with('<') {
        // An HTML page instead of CSV means the login was refused.
        return Err(AccountError::Parse("login rejected".into()));
    }

    let columns: Vec<String> = split_row(header)
        .into_iter()
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let index = |name: &str| columns.iter().position(|c| c == name);
    let (rectype_col, date_col, balance_col) = match (index("RECTYPE"), index("DATE"), index("BALANCE")) {
        (Some(r), Some(d), Some(b)) => (r, d, b),
        _ => {
            return Err(AccountError::Parse(format!(
                "unexpected header '{header}'"
            )));
        }
    };
    let machine_col = index("MACHINE");

    let mut latest: Option<(Decimal, NaiveDate)> = None;
    let mut last_machine_activity: Option<NaiveDate> = None;

    for line in lines {
        let fields = split_row(line);
        let field = |i: usize| fields.get(i).map(String::as_str).unwrap_or("");
        let Ok(date) = NaiveDate::parse_from_str(field(date_col), "%Y-%m-%d") else {
            continue;
        };

        if field(rectype_col).eq_ignore_ascii_case("balance") {
            let credit: Decimal = field(balance_col)
                .parse()
                .map_err(|e| AccountError::Parse(format!("bad balance '{}': {e}", field(balance_col))))?;
            if latest.is_none_or(|(_, seen)| date >= seen) {
                latest = Some((credit, date));
            }
        }

        if let (Some(machine), Some(col)) = (machine, machine_col) {
            if field(col) == machine && last_machine_activity.is_none_or(|seen| date > seen) {
                last_machine_activity = Some(date);
            }
        }
    }

    let (credit, as_of) =
        latest.ok_or_else(|| AccountError::Parse("no balance rows in report".into()))?;
    Ok(AccountStatus {
        credit,
        as_of,
        last_machine_activity,
    })
}

/// Split a CSV row, honouring double-quoted fields.
fn split_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current).trim().to_string()),
            c => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const REPORT: &str = "\
RECTYPE,DATE,MACHINE,AMOUNT,BALANCE
Payment,2024-01-02,,10.000000000000000000,
Balance,2024-01-02,,,10.000000000000000000
Client->Server bandwidth,2024-01-03,laptop,0.250000000000000000,
Balance,2024-01-03,,,9.750000000000000000
Daily storage,2024-01-04,\"desk, top\",0.010000000000000000,
Balance,2024-01-04,,,9.740000000000000000
";

    #[test]
    fn latest_balance_wins() {
        let status = parse_activity_csv(REPORT, None).unwrap();
        assert_eq!(status.credit, dec!(9.74));
        assert_eq!(status.as_of, NaiveDate::from_ymd_opt(2024, 1, 4).unwrap());
        assert!(status.last_machine_activity.is_none());
    }

    #[test]
    fn machine_activity_tracked() {
        let status = parse_activity_csv(REPORT, Some("laptop")).unwrap();
        assert_eq!(
            status.last_machine_activity,
            NaiveDate::from_ymd_opt(2024, 1, 3)
        );
        let status = parse_activity_csv(REPORT, Some("desk, top")).unwrap();
        assert_eq!(
            status.last_machine_activity,
            NaiveDate::from_ymd_opt(2024, 1, 4)
        );
    }

    #[test]
    fn negative_balance_parsed() {
        let report = "RECTYPE,DATE,BALANCE\nBalance,2024-02-01,-0.5\n";
        let status = parse_activity_csv(report, None).unwrap();
        assert!(status.credit.is_sign_negative());
    }

    #[test]
    fn html_login_page_rejected() {
        let err = parse_activity_csv("<html><body>Password incorrect</body></html>", None).unwrap_err();
        assert!(matches!(err, AccountError::Parse(_)));
    }

    #[test]
    fn missing_columns_rejected() {
        assert!(parse_activity_csv("FOO,BAR\n1,2\n", None).is_err());
        assert!(parse_activity_csv("RECTYPE,DATE,BALANCE\n", None).is_err());
    }
}
