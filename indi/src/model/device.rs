use super::property::Property;

/// A remote INDI device and its properties in announcement order
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub name: String,
    properties: Vec<Property>,
}

impl Device {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            properties: Vec::new(),
        }
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties.iter_mut().find(|p| p.name == name)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.property(name).is_some()
    }

    pub fn property_names(&self) -> Vec<&str> {
        self.properties.iter().map(|p| p.name.as_str()).collect()
    }

    /// Distinct group names, first-seen order
    pub fn groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = Vec::new();
        for p in &self.properties {
            if !groups.contains(&p.group.as_str()) {
                groups.push(&p.group);
            }
        }
        groups
    }

    pub fn properties_in_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a Property> + 'a {
        self.properties.iter().filter(move |p| p.group == group)
    }

    /// Insert or replace in place. Returns true when an older definition was replaced.
    pub(crate) fn upsert(&mut self, property: Property) -> bool {
        match self.properties.iter_mut().find(|p| p.name == property.name) {
            Some(existing) => {
                *existing = property;
                true
            }
            None => {
                self.properties.push(property);
                false
            }
        }
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Property> {
        let idx = self.properties.iter().position(|p| p.name == name)?;
        Some(self.properties.remove(idx))
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}
