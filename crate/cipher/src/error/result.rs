use std::fmt::Display;

use crate::error::CipherError;

pub type CResult<R> = Result<R, CipherError>;

pub trait CipherResultHelper<T> {
    fn context(self, context: &str) -> CResult<T>;
    fn with_context<D, O>(self, op: O) -> CResult<T>
    where
        D: Display + Send + Sync + 'static,
        O: FnOnce() -> D;
}

impl<T, E> CipherResultHelper<T> for Result<T, E>
where
    E: std::error::Error,
{
    fn context(self, context: &str) -> CResult<T> {
        self.map_err(|e| CipherError::Default(format!("{context}: {e}")))
    }

    fn with_context<D, O>(self, op: O) -> CResult<T>
    where
        D: Display + Send + Sync + 'static,
        O: FnOnce() -> D,
    {
        self.map_err(|e| CipherError::Default(format!("{}: {e}", op())))
    }
}

impl<T> CipherResultHelper<T> for Option<T> {
    fn context(self, context: &str) -> CResult<T> {
        self.ok_or_else(|| CipherError::Default(context.to_owned()))
    }

    fn with_context<D, O>(self, op: O) -> CResult<T>
    where
        D: Display + Send + Sync + 'static,
        O: FnOnce() -> D,
    {
        self.ok_or_else(|| CipherError::Default(format!("{}", op())))
    }
}
