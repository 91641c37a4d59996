//! Safe wrappers around the raw-pointer `CollectiveTransport` trait.
//!
//! Keeps the contiguity-check → extract-pointer → unsafe-call pattern in one
//! place so the sharding code never touches raw pointers.

use crate::distributed::group_cache::GroupHandle;
use crate::distributed::transport::CollectiveTransport;
use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// All-gather a 1-D tensor over `group`.
///
/// Every member contributes `send.numel()` elements. Returns a flat tensor of
/// `send.numel() * group.size()` elements holding the contributions in group
/// rank order. Blocks until every member of the group has made the call.
pub fn all_gather_tensor<R: Runtime<DType = DType>>(
    transport: &dyn CollectiveTransport,
    send: &Tensor<R>,
    group: &GroupHandle,
) -> Result<Tensor<R>> {
    if !send.is_contiguous() {
        return Err(Error::DistributedError {
            reason: "all_gather requires contiguous tensor".to_string(),
        });
    }

    let count = send.numel();
    let dtype = send.dtype();
    let total_count = count * group.size();

    let recv = Tensor::<R>::zeros(&[total_count], dtype, send.device());

    // Safety: send is contiguous with `count` elements of `dtype`, and recv was
    // just allocated with `count * group.size()` elements of the same dtype
    unsafe {
        transport.all_gather(send.ptr(), recv.ptr(), count, dtype, group)?;
    }

    Ok(recv)
}
