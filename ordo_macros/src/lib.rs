//! Derive macros for ordo.
//!
//! `#[derive(FlowType)]` writes the `ordo::core::FlowType` impl that every
//! flow needs: a stable type id, the business key and the activities the
//! flow calls. `#[invokable(output = T)]` on the same struct also makes it
//! callable as a child flow.

use proc_macro::TokenStream;

mod flow_type;
mod parsing;

/// Derives `ordo::core::FlowType` for a struct with named fields.
///
/// Exactly one field carries `#[business_key]`. A nested value is reached
/// with a dotted path: `#[business_key(id)]` on an `order` field keys the
/// instance by `self.order.id`. The key is rendered with `ToString`.
///
/// Container attributes:
/// - `#[flow_type(id = "...")]`: type id persisted in the queue, defaults to
///   the struct name
/// - `#[flow_type(activities(A, B))]`: activity types the flow calls, checked
///   at registration through their `NAME`
/// - `#[invokable(output = T)]`: also implements `InvokableFlow` with
///   `Output = T`
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize, FlowType)]
/// #[flow_type(activities(Deliver))]
/// #[invokable(output = String)]
/// pub struct DeliverOrder {
///     #[business_key]
///     pub order_id: String,
/// }
/// ```
#[proc_macro_derive(FlowType, attributes(flow_type, business_key, invokable))]
pub fn derive_flow_type(input: TokenStream) -> TokenStream {
    flow_type::derive_flow_type_impl(input)
}
