//! Service directory backing publish/lookup/unpublish. Entries are keyed
//! by (service, key, persistence); `first_read` entries vanish after their
//! first successful lookup.

use crate::status::{PmixResult, Status};
use crate::types::{Info, Persistence};

#[derive(Debug, Clone)]
pub struct PubEntry {
    pub service: String,
    pub info: Info,
    pub persistence: Persistence,
    /// Namespace of the publishing peer.
    pub owner: String,
}

pub struct Directory {
    entries: Vec<PubEntry>,
}

impl Directory {
    pub fn new() -> Directory {
        Directory {
            entries: Vec::new(),
        }
    }

    /// Stores the supplied entries, replacing any that collide on
    /// (service, key, persistence).
    pub fn publish(
        &mut self,
        service: &str,
        persistence: Persistence,
        owner: &str,
        infos: Vec<Info>,
    ) -> PmixResult<()> {
        for info in infos {
            if info.key.is_empty() || info.key.len() > crate::types::MAX_KEYLEN {
                return Err(Status::BadParam);
            }
            self.entries.retain(|entry| {
                !(entry.service == service
                    && entry.info.key == info.key
                    && entry.persistence == persistence)
            });
            self.entries.push(PubEntry {
                service: service.to_string(),
                info,
                persistence,
                owner: owner.to_string(),
            });
        }
        Ok(())
    }

    /// True when every requested key is currently published under the
    /// service.
    pub fn all_present(&self, service: &str, keys: &[String]) -> bool {
        keys.iter().all(|key| {
            self.entries
                .iter()
                .any(|entry| entry.service == service && &entry.info.key == key)
        })
    }

    /// Resolves the requested keys. On success returns the publishing
    /// namespace and the matched entries, removing any `first_read` ones.
    /// Missing keys fail the whole lookup with `NotFound`.
    pub fn lookup(&mut self, service: &str, keys: &[String]) -> PmixResult<(String, Vec<Info>)> {
        if !self.all_present(service, keys) {
            return Err(Status::NotFound);
        }
        let mut owner: Option<String> = None;
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            let pos = self
                .entries
                .iter()
                .position(|entry| entry.service == service && &entry.info.key == key)
                .expect("Presence was checked");
            if owner.is_none() {
                owner = Some(self.entries[pos].owner.clone());
            }
            if self.entries[pos].persistence == Persistence::FirstRead {
                found.push(self.entries.remove(pos).info);
            } else {
                found.push(self.entries[pos].info.clone());
            }
        }
        Ok((owner.unwrap_or_default(), found))
    }

    /// Removes matching keys. An empty key list purges everything the
    /// caller's namespace owns at the given persistence, or at every
    /// persistence when none is named.
    pub fn unpublish(
        &mut self,
        owner: &str,
        service: &str,
        keys: &[String],
        persistence: Option<Persistence>,
    ) -> PmixResult<()> {
        let before = self.entries.len();
        if keys.is_empty() {
            self.entries.retain(|entry| {
                !(entry.owner == owner
                    && persistence.map_or(true, |p| entry.persistence == p))
            });
        } else {
            self.entries.retain(|entry| {
                !(entry.service == service
                    && keys.contains(&entry.info.key)
                    && persistence.map_or(true, |p| entry.persistence == p))
            });
        }
        if self.entries.len() == before {
            return Err(Status::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn port_info() -> Info {
        Info::new("port", Value::String("tcp://127.0.0.1:5000".into()))
    }

    #[test]
    fn test_publish_lookup() {
        let mut dir = Directory::new();
        dir.publish("svc", Persistence::Session, "job", vec![port_info()])
            .unwrap();

        let (owner, found) = dir.lookup("svc", &["port".to_string()]).unwrap();
        assert_eq!(owner, "job");
        assert_eq!(found, vec![port_info()]);

        // Session persistence survives lookups.
        assert!(dir.lookup("svc", &["port".to_string()]).is_ok());
    }

    #[test]
    fn test_first_read_removed_after_lookup() {
        let mut dir = Directory::new();
        dir.publish("svc", Persistence::FirstRead, "job", vec![port_info()])
            .unwrap();

        assert!(dir.lookup("svc", &["port".to_string()]).is_ok());
        assert_eq!(
            dir.lookup("svc", &["port".to_string()]),
            Err(Status::NotFound)
        );
    }

    #[test]
    fn test_partial_lookup_fails_whole() {
        let mut dir = Directory::new();
        dir.publish("svc", Persistence::FirstRead, "job", vec![port_info()])
            .unwrap();

        let keys = vec!["port".to_string(), "missing".to_string()];
        assert_eq!(dir.lookup("svc", &keys), Err(Status::NotFound));
        // The failed lookup must not have consumed the first_read entry.
        assert!(dir.lookup("svc", &["port".to_string()]).is_ok());
    }

    #[test]
    fn test_republish_replaces() {
        let mut dir = Directory::new();
        dir.publish("svc", Persistence::Session, "job", vec![port_info()])
            .unwrap();
        dir.publish(
            "svc",
            Persistence::Session,
            "job",
            vec![Info::new("port", Value::String("tcp://0.0.0.0:1".into()))],
        )
        .unwrap();

        let (_, found) = dir.lookup("svc", &["port".to_string()]).unwrap();
        assert_eq!(found[0].value, Value::String("tcp://0.0.0.0:1".into()));
    }

    #[test]
    fn test_unpublish_by_key() {
        let mut dir = Directory::new();
        dir.publish("svc", Persistence::Session, "job", vec![port_info()])
            .unwrap();
        dir.unpublish("job", "svc", &["port".to_string()], None)
            .unwrap();
        assert_eq!(
            dir.lookup("svc", &["port".to_string()]),
            Err(Status::NotFound)
        );
    }

    #[test]
    fn test_unpublish_purges_owner_at_persistence() {
        let mut dir = Directory::new();
        dir.publish("a", Persistence::Session, "job", vec![port_info()])
            .unwrap();
        dir.publish("b", Persistence::App, "job", vec![Info::new("k", Value::Int(1))])
            .unwrap();
        dir.publish("c", Persistence::Session, "other", vec![Info::new("k", Value::Int(2))])
            .unwrap();

        dir.unpublish("job", "", &[], Some(Persistence::Session))
            .unwrap();
        assert_eq!(dir.lookup("a", &["port".to_string()]), Err(Status::NotFound));
        assert!(dir.lookup("b", &["k".to_string()]).is_ok());
        assert!(dir.lookup("c", &["k".to_string()]).is_ok());
    }

    #[test]
    fn test_unpublish_missing_is_not_found() {
        let mut dir = Directory::new();
        assert_eq!(
            dir.unpublish("job", "svc", &["nope".to_string()], None),
            Err(Status::NotFound)
        );
    }
}
