/// Generates the opaque ids used for bills, line items, and updates.
pub trait BillIdGenerator: Send + Sync {
    fn new_id(&self) -> String;
}

/// The production generator: random v4 UUIDs.
#[derive(Clone, Copy, Debug, Default)]
pub struct UuidBillIdGenerator;

impl BillIdGenerator for UuidBillIdGenerator {
    fn new_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
