use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;
use crate::store::{BookingStore, StoreError};

use super::{Engine, EngineError};

impl Engine {
    /// Every listed property. Waits behind in-flight writes rather than
    /// skipping the properties they hold.
    pub async fn list_properties(&self) -> Vec<PropertyInfo> {
        let properties: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(properties.len());
        for ps in properties {
            infos.push(property_info_of(&*ps.read().await));
        }
        infos
    }

    pub async fn property_info(&self, id: Ulid) -> Result<PropertyInfo, EngineError> {
        let ps = self.get_property(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ps.read().await;
        Ok(property_info_of(&guard))
    }

    /// All bookings on a property, cancelled ones included, by check-in.
    pub async fn get_bookings(&self, property_id: Ulid) -> Result<Vec<BookingInfo>, EngineError> {
        let ps = match self.get_property(&property_id) {
            Some(ps) => ps,
            None => return Ok(vec![]),
        };
        let guard = ps.read().await;
        Ok(guard
            .bookings
            .iter()
            .map(|b| BookingInfo::from_booking(property_id, b))
            .collect())
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        let property_id = self
            .get_property_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let ps = self
            .get_property(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = ps.read().await;
        guard
            .booking(id)
            .map(|b| BookingInfo::from_booking(property_id, b))
            .ok_or(EngineError::NotFound(id))
    }
}

fn property_info_of(ps: &PropertyState) -> PropertyInfo {
    PropertyInfo {
        id: ps.id,
        host_id: ps.host_id,
        name: ps.name.clone(),
        nightly_rate: ps.nightly_rate,
        max_guests: ps.max_guests,
    }
}

#[async_trait]
impl BookingStore for Engine {
    async fn list_bookings_for_property(
        &self,
        property_id: Ulid,
        exclude: &[BookingStatus],
    ) -> Result<Vec<BookedStay>, StoreError> {
        let ps = match self.get_property(&property_id) {
            Some(ps) => ps,
            None => return Ok(vec![]),
        };
        let guard = ps.read().await;
        Ok(guard
            .bookings
            .iter()
            .filter(|b| !exclude.contains(&b.status))
            .map(|b| BookedStay {
                id: b.id,
                stay: b.stay,
                status: b.status,
            })
            .collect())
    }
}
