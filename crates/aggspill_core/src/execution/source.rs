use aggspill_error::Result;

use super::cancel::CancellationToken;
use crate::arrays::batch::Batch;
use crate::arrays::datatype::DataType;

/// A pull-based stream of batches.
///
/// Every batch returned must have columns matching `datatypes`. `Ok(None)`
/// signals the end of the stream, after which sources should keep returning
/// `Ok(None)`.
pub trait BatchSource: Send {
    /// Types of the columns produced by this source.
    fn datatypes(&self) -> &[DataType];

    /// Pull the next batch.
    ///
    /// Sources that can block for long periods should check the token and
    /// return early once it's cancelled.
    fn read(&mut self, token: &CancellationToken) -> Result<Option<Batch>>;
}

impl<S: BatchSource + ?Sized> BatchSource for Box<S> {
    fn datatypes(&self) -> &[DataType] {
        (**self).datatypes()
    }

    fn read(&mut self, token: &CancellationToken) -> Result<Option<Batch>> {
        (**self).read(token)
    }
}
