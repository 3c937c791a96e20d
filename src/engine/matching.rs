use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::DispatchError;
use crate::models::driver::DriverProfile;
use crate::models::order::Order;
use crate::store::OrderStore;

/// Surfaces available drivers for a pending order. Advisory only: nothing is
/// reserved here, exclusivity is settled when a driver accepts.
pub struct DriverMatcher {
    store: Arc<dyn OrderStore>,
}

/// The best `limit` drivers as of the moment they were fetched. The ranking
/// is done once, up front, over the available drivers; iteration walks that
/// snapshot and can be repeated.
#[derive(Debug, Clone)]
pub struct Candidates {
    ranked: Vec<DriverProfile>,
    limit: usize,
}

impl Candidates {
    pub fn iter(&self) -> impl Iterator<Item = &DriverProfile> + '_ {
        self.ranked.iter().take(self.limit)
    }

    pub fn len(&self) -> usize {
        self.ranked.len().min(self.limit)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> IntoIterator for &'a Candidates {
    type Item = &'a DriverProfile;
    type IntoIter = std::iter::Take<std::slice::Iter<'a, DriverProfile>>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranked.iter().take(self.limit)
    }
}

impl DriverMatcher {
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self { store }
    }

    pub async fn find_candidates(
        &self,
        order: &Order,
        limit: usize,
    ) -> Result<Candidates, DispatchError> {
        let drivers = self.store.list_drivers().await?;
        Ok(rank_candidates(order, drivers, limit))
    }
}

pub fn rank_candidates(order: &Order, drivers: Vec<DriverProfile>, limit: usize) -> Candidates {
    let mut ranked: Vec<DriverProfile> = drivers
        .into_iter()
        .filter(|driver| driver.is_available && driver.id != order.sender_id)
        .collect();

    if limit == 0 {
        ranked.clear();
    } else if limit < ranked.len() {
        ranked.select_nth_unstable_by(limit - 1, compare_candidates);
        ranked.truncate(limit);
    }
    ranked.sort_by(compare_candidates);

    Candidates { ranked, limit }
}

/// Higher rating first, then more deliveries, then lower id.
pub fn compare_candidates(a: &DriverProfile, b: &DriverProfile) -> Ordering {
    b.rating
        .total_cmp(&a.rating)
        .then_with(|| b.total_deliveries.cmp(&a.total_deliveries))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{compare_candidates, rank_candidates};
    use crate::models::driver::{DriverProfile, VehicleType};
    use crate::models::order::{Order, OrderStatus, PaymentStatus};

    fn driver(id_seed: u128, available: bool, rating: f64, deliveries: u64) -> DriverProfile {
        DriverProfile {
            id: Uuid::from_u128(id_seed),
            is_available: available,
            rating,
            total_deliveries: deliveries,
            vehicle_type: VehicleType::Motorcycle,
            updated_at: Utc::now(),
        }
    }

    fn order(sender_seed: u128) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            tracking_code: "FKS-TEST".to_string(),
            sender_id: Uuid::from_u128(sender_seed),
            receiver_name: "Otieno".to_string(),
            receiver_phone: "+254700000000".to_string(),
            driver_id: None,
            pickup_address: "Kenyatta Avenue".to_string(),
            delivery_address: "Westlands".to_string(),
            delivery_amount: 300,
            payment_status: PaymentStatus::Unpaid,
            payment_method: None,
            payment_reference: None,
            status: OrderStatus::Pending,
            confirmation_code: None,
            confirmation_verified_at: None,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    fn ids(candidates: &super::Candidates) -> Vec<u128> {
        candidates.iter().map(|d| d.id.as_u128()).collect()
    }

    #[test]
    fn unavailable_drivers_are_skipped() {
        let drivers = vec![driver(1, false, 5.0, 100), driver(2, true, 3.0, 1)];
        let candidates = rank_candidates(&order(99), drivers, 5);
        assert_eq!(ids(&candidates), vec![2]);
    }

    #[test]
    fn rating_then_deliveries_then_id() {
        let drivers = vec![
            driver(4, true, 4.0, 10),
            driver(3, true, 4.5, 5),
            driver(2, true, 4.0, 50),
            driver(1, true, 4.0, 10),
        ];
        let candidates = rank_candidates(&order(99), drivers, 10);
        assert_eq!(ids(&candidates), vec![3, 2, 1, 4]);
    }

    #[test]
    fn limit_bounds_the_sequence_and_iteration_restarts() {
        let drivers = (1..=8).map(|n| driver(n, true, 4.0, n as u64)).collect();
        let candidates = rank_candidates(&order(99), drivers, 3);

        assert_eq!(candidates.len(), 3);
        assert_eq!(ids(&candidates), vec![8, 7, 6]);
        assert_eq!(ids(&candidates), vec![8, 7, 6]);
    }

    #[test]
    fn top_of_a_large_pool_matches_a_full_sort() {
        let drivers: Vec<DriverProfile> = (1..=200)
            .map(|n| driver(n, n % 7 != 0, (n % 11) as f64 / 2.0, (n * 37 % 101) as u64))
            .collect();

        let mut expected: Vec<DriverProfile> = drivers
            .iter()
            .filter(|d| d.is_available)
            .cloned()
            .collect();
        expected.sort_by(compare_candidates);
        let expected: Vec<u128> = expected.iter().take(5).map(|d| d.id.as_u128()).collect();

        let candidates = rank_candidates(&order(999), drivers, 5);
        assert_eq!(ids(&candidates), expected);
    }

    #[test]
    fn zero_limit_yields_nothing() {
        let candidates = rank_candidates(&order(99), vec![driver(1, true, 5.0, 0)], 0);
        assert!(candidates.is_empty());
    }

    #[test]
    fn sender_is_never_their_own_driver() {
        let candidates = rank_candidates(&order(1), vec![driver(1, true, 5.0, 0)], 5);
        assert!(candidates.is_empty());
    }
}
