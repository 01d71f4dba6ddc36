use crate::error::Result;
use crate::se;

pub fn now_seconds() -> Result<i64> {
    Ok(std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| se!("invalid system time {:?}", e))?
        .as_secs() as i64)
}
