use std::env;
use std::time::Duration;

use crate::error::{InitializationError, InitializationResult};

fn make_prefix<T: Into<String>>(prefix: Option<T>) -> String {
    prefix
        .map(Into::into)
        .unwrap_or_else(|| "EGRESSPOOL".to_string())
}

fn set_usize<T, F>(prefix: Option<T>, name: &str, mut f: F) -> InitializationResult<()>
where
    F: FnMut(usize),
    T: Into<String>,
{
    let prefix = make_prefix(prefix);

    let key = format!("{}_{}", prefix, name);
    match env::var(&key) {
        Ok(s) => {
            f(s.parse()
                .map_err(|err| InitializationError::new(key, Some(err)))?);
            Ok(())
        }
        Err(env::VarError::NotPresent) => Ok(()),
        Err(err) => Err(InitializationError::new(key, Some(err))),
    }
}

fn set_millis<T, F>(prefix: Option<T>, name: &str, mut f: F) -> InitializationResult<()>
where
    F: FnMut(Duration),
    T: Into<String>,
{
    let prefix = make_prefix(prefix);

    let key = format!("{}_{}", prefix, name);
    match env::var(&key) {
        Ok(s) => {
            let millis: u64 = s
                .parse()
                .map_err(|err| InitializationError::new(key, Some(err)))?;
            f(Duration::from_millis(millis));
            Ok(())
        }
        Err(env::VarError::NotPresent) => Ok(()),
        Err(err) => Err(InitializationError::new(key, Some(err))),
    }
}

pub fn set_min_connections<T, F>(prefix: Option<T>, f: F) -> InitializationResult<()>
where
    F: FnMut(usize),
    T: Into<String>,
{
    set_usize(prefix, "MIN_CONNECTIONS", f)
}

pub fn set_max_connections<T, F>(prefix: Option<T>, f: F) -> InitializationResult<()>
where
    F: FnMut(usize),
    T: Into<String>,
{
    set_usize(prefix, "MAX_CONNECTIONS", f)
}

pub fn set_max_connecting<T, F>(prefix: Option<T>, f: F) -> InitializationResult<()>
where
    F: FnMut(usize),
    T: Into<String>,
{
    set_usize(prefix, "MAX_CONNECTING", f)
}

pub fn set_refresh_requirement<T, F>(prefix: Option<T>, f: F) -> InitializationResult<()>
where
    F: FnMut(Duration),
    T: Into<String>,
{
    set_millis(prefix, "REFRESH_REQUIREMENT_MS", f)
}

pub fn set_refresh_timeout<T, F>(prefix: Option<T>, f: F) -> InitializationResult<()>
where
    F: FnMut(Duration),
    T: Into<String>,
{
    set_millis(prefix, "REFRESH_TIMEOUT_MS", f)
}

pub fn set_host_timeout<T, F>(prefix: Option<T>, f: F) -> InitializationResult<()>
where
    F: FnMut(Duration),
    T: Into<String>,
{
    set_millis(prefix, "HOST_TIMEOUT_MS", f)
}
