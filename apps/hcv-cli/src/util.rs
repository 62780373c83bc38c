use anyhow::Result;
use serde::Serialize;

/// JSON on stdout; logs stay on stderr.
pub struct Output {
    pub pretty: bool,
}

impl Output {
    pub fn json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", render(value, self.pretty)?);
        Ok(())
    }
}

pub fn render<T: Serialize>(value: &T, pretty: bool) -> Result<String> {
    Ok(if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    })
}
