// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed registry of the codec features a pipeline works with.
//!
//! Features are the per-codec data containers (picture parameters, rate control state...) that
//! packets read while emitting commands. They are looked up by their Rust type, so an accessor
//! can never hand out a feature of the wrong kind.

use std::any::Any;
use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::MediaError;
use crate::MediaResult;

/// Shared handle to a registered feature.
pub type FeatureRef<F> = Rc<RefCell<F>>;

#[derive(Default)]
pub struct FeatureManager {
    features: HashMap<TypeId, Rc<dyn Any>>,
}

impl FeatureManager {
    /// Creates a manager with room for `capacity` features.
    pub fn try_new(capacity: usize) -> MediaResult<Self> {
        let mut features = HashMap::new();
        features.try_reserve(capacity).map_err(|e| {
            MediaError::Unknown(format!("failed to allocate the feature manager: {e}"))
        })?;
        Ok(Self { features })
    }

    /// Registers `feature`, replacing any feature of the same type, and returns its handle.
    pub fn register<F: 'static>(&mut self, feature: F) -> FeatureRef<F> {
        let feature = Rc::new(RefCell::new(feature));
        self.features.insert(TypeId::of::<F>(), feature.clone());
        feature
    }

    pub fn get<F: 'static>(&self) -> Option<FeatureRef<F>> {
        self.features
            .get(&TypeId::of::<F>())
            .and_then(|f| Rc::clone(f).downcast::<RefCell<F>>().ok())
    }

    /// Like [`FeatureManager::get`], failing when the feature was never registered.
    pub fn feature<F: 'static>(&self) -> MediaResult<FeatureRef<F>> {
        self.get::<F>().ok_or(MediaError::NullPointer(std::any::type_name::<F>()))
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn clear(&mut self) {
        self.features.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Picture {
        width: u32,
    }

    struct RateControl;

    #[test]
    fn test_typed_lookup() {
        let mut manager = FeatureManager::try_new(4).unwrap();
        assert!(manager.is_empty());

        let picture = manager.register(Picture { width: 64 });
        picture.borrow_mut().width = 128;

        assert_eq!(manager.get::<Picture>().unwrap().borrow().width, 128);
        assert!(manager.get::<RateControl>().is_none());
        assert!(matches!(manager.feature::<RateControl>(), Err(MediaError::NullPointer(_))));

        manager.register(RateControl);
        manager.register(Picture::default());
        assert_eq!(manager.len(), 2);
        assert_eq!(*manager.feature::<Picture>().unwrap().borrow(), Picture::default());
        // The handle to the replaced feature stays valid.
        assert_eq!(picture.borrow().width, 128);
    }
}
