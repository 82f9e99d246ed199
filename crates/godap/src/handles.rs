use std::collections::HashMap;

/// First handle value handed out. Editors treat `0` as "no children", so
/// handles stay well clear of it.
pub const FIRST_HANDLE: i64 = 1000;

/// Maps DAP integer references (`variablesReference`, `frameId`) to values.
///
/// [`HandleTable::reset`] drops every entry but keeps counting, so a handle
/// from before a reset can never alias a value created after it.
#[derive(Debug)]
pub struct HandleTable<T> {
    next: i64,
    items: HashMap<i64, T>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            next: FIRST_HANDLE,
            items: HashMap::new(),
        }
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, value: T) -> i64 {
        let handle = self.next;
        self.next += 1;
        self.items.insert(handle, value);
        handle
    }

    pub fn get(&self, handle: i64) -> Option<&T> {
        self.items.get(&handle)
    }

    pub fn get_mut(&mut self, handle: i64) -> Option<&mut T> {
        self.items.get_mut(&handle)
    }

    pub fn reset(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
