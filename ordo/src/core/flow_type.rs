//! Stable flow type identification.
//!
//! `std::any::type_name()` is explicitly unstable across compiler versions, so
//! flows name themselves. The name is persisted in the queue and routes a
//! dequeued instance to the handler registered for it, which means it must
//! not change while instances of the old name are still in flight.

use uuid::Uuid;

/// Namespace for deterministic flow ids.
const FLOW_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f72_646f_2d66_6c6f_772d_6964_2d6e_7331);

/// Provides a stable type identifier and a business key for a flow.
///
/// The pair `(type_id, business_key)` names one workflow instance. Starting
/// the same pair twice is rejected while the first instance exists.
pub trait FlowType {
    /// Returns a stable type identifier for this flow type.
    fn type_id() -> &'static str;

    /// The domain identifier of this instance, e.g. the order id.
    fn business_key(&self) -> String;

    /// Names of the activities this flow invokes.
    ///
    /// `Worker::register` refuses a flow whose activities are not all
    /// registered, so a missing activity is found at startup rather than in
    /// the middle of an order.
    fn required_activities() -> &'static [&'static str] {
        &[]
    }
}

/// Marker trait for flows that can be invoked as child flows.
///
/// ```ignore
/// #[derive(Serialize, Deserialize, FlowType)]
/// #[invokable(output = String)]
/// pub struct DeliverOrder {
///     #[business_key]
///     pub order_id: String,
/// }
///
/// let confirmation = self.invoke(DeliverOrder::new(order_id)).result().await?;
/// ```
pub trait InvokableFlow: FlowType {
    /// The type returned by this flow's execution.
    type Output: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static;
}

/// Deterministic instance id for a flow type and business key.
pub fn flow_id_for(type_id: &str, business_key: &str) -> Uuid {
    Uuid::new_v5(
        &FLOW_ID_NAMESPACE,
        format!("{}:{}", type_id, business_key).as_bytes(),
    )
}

/// Deterministic instance id of a flow value.
pub fn flow_id_of<F: FlowType>(flow: &F) -> Uuid {
    flow_id_for(F::type_id(), &flow.business_key())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pickup {
        order_id: String,
    }

    impl FlowType for Pickup {
        fn type_id() -> &'static str {
            "Pickup"
        }

        fn business_key(&self) -> String {
            self.order_id.clone()
        }
    }

    #[test]
    fn test_flow_id_is_deterministic() {
        let a = Pickup {
            order_id: "o-1".into(),
        };
        let b = Pickup {
            order_id: "o-1".into(),
        };
        assert_eq!(flow_id_of(&a), flow_id_of(&b));
        assert_eq!(flow_id_of(&a), flow_id_for("Pickup", "o-1"));
    }

    #[test]
    fn test_flow_id_depends_on_type_and_key() {
        assert_ne!(flow_id_for("Pickup", "o-1"), flow_id_for("Pickup", "o-2"));
        assert_ne!(flow_id_for("Pickup", "o-1"), flow_id_for("Dropoff", "o-1"));
        assert!(Pickup::required_activities().is_empty());
    }
}
