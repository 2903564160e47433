// =============================================================================
// Instrument sync -- Kite Connect instrument dump
// =============================================================================
//
// Kite publishes the full instrument master per exchange as CSV at
// `GET /instruments/{exchange}`. We only need the token/symbol pairs to seed
// the lookup table.
// =============================================================================

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::types::Instrument;

const KITE_API_BASE: &str = "https://api.kite.trade";

/// Download and parse the instrument master for one exchange.
pub async fn fetch_kite_instruments(
    client: &reqwest::Client,
    api_key: &str,
    access_token: &str,
    exchange: &str,
) -> Result<Vec<Instrument>> {
    let url = format!("{KITE_API_BASE}/instruments/{exchange}");
    info!(url = %url, exchange = %exchange, "downloading instrument master");

    let resp = client
        .get(&url)
        .header("X-Kite-Version", "3")
        .header("Authorization", format!("token {api_key}:{access_token}"))
        .send()
        .await
        .context("instrument request failed")?;

    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("instrument download for {exchange} returned HTTP {status}");
    }

    let body = resp.text().await.context("failed to read instrument CSV")?;
    let instruments = parse_instrument_csv(&body)?;
    info!(exchange = %exchange, count = instruments.len(), "instrument master parsed");
    Ok(instruments)
}

/// Parse the Kite instrument CSV. Column positions come from the header row.
pub fn parse_instrument_csv(text: &str) -> Result<Vec<Instrument>> {
    let mut lines = text.lines();
    let header = lines.next().context("instrument CSV is empty")?;
    let columns = split_csv_line(header);

    let idx = |name: &str| {
        columns
            .iter()
            .position(|c| c == name)
            .with_context(|| format!("instrument CSV missing column '{name}'"))
    };
    let token_idx = idx("instrument_token")?;
    let symbol_idx = idx("tradingsymbol")?;
    let exchange_idx = idx("exchange")?;

    let mut out = Vec::new();
    for (line_no, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_csv_line(line);
        let (Some(token), Some(symbol), Some(exchange)) = (
            fields.get(token_idx),
            fields.get(symbol_idx),
            fields.get(exchange_idx),
        ) else {
            warn!(line = line_no + 2, "short instrument row skipped");
            continue;
        };
        match token.parse::<u32>() {
            Ok(token) => out.push(Instrument::new(exchange.clone(), symbol.clone(), token)),
            Err(_) => warn!(line = line_no + 2, token = %token, "bad instrument token skipped"),
        }
    }
    Ok(out)
}

/// Minimal CSV field splitter: handles double-quoted fields with embedded
/// commas and `""` escapes.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "instrument_token,exchange_token,tradingsymbol,name,last_price,expiry,strike,tick_size,lot_size,instrument_type,segment,exchange
738561,2885,RELIANCE,\"RELIANCE INDUSTRIES, LTD\",0,,0,0.05,1,EQ,NSE,NSE
2953217,11536,TCS,TATA CONSULTANCY SERV LT,0,,0,0.05,1,EQ,NSE,NSE
bogus,1,BAD,BAD,0,,0,0.05,1,EQ,NSE,NSE
";

    #[test]
    fn parses_rows_and_skips_bad_tokens() {
        let instruments = parse_instrument_csv(SAMPLE).unwrap();
        assert_eq!(instruments.len(), 2);
        assert_eq!(instruments[0], Instrument::new("NSE", "RELIANCE", 738561));
        assert_eq!(instruments[1].symbol, "TCS");
    }

    #[test]
    fn quoted_fields_keep_commas() {
        let fields = split_csv_line("1,\"A, B\",\"say \"\"hi\"\"\"");
        assert_eq!(fields, vec!["1", "A, B", "say \"hi\""]);
    }

    #[test]
    fn missing_column_is_an_error() {
        assert!(parse_instrument_csv("foo,bar\n1,2\n").is_err());
    }
}
