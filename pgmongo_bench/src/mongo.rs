//! MongoDB provider.  Records are documents keyed by `_id`.

use futures::TryStreamExt;
use guacamole::Guacamole;
use indicio::{clue, INFO};
use mongodb::bson::{doc, Document};
use mongodb::options::{Acknowledgment, ClientOptions, FindOneOptions, ReadConcern, WriteConcern};
use mongodb::{Client, Collection};
use url::Url;

use crate::blocking::BlockingClient;
use crate::endpoint::{parse_flag, take_query_param};
use crate::record::{random_balance, RANGE_AGE_LOWER, RANGE_AGE_UPPER};
use crate::{
    outcome, sample_existing, update_missed, ConnectOptions, Error, IdGenerator, Operation,
    Provider, Record, COLLECTOR,
};

//////////////////////////////////////////// Durability ////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
/// The `readConcern` knob.
pub enum ReadLevel {
    #[default]
    Majority,
    Local,
    Linearizable,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
/// The `writeConcern` knob.
pub enum WriteLevel {
    #[default]
    Majority,
    Nodes(u32),
}

/// The consistency knobs accepted in a mongodb endpoint's query string.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Durability {
    pub read: ReadLevel,
    pub write: WriteLevel,
    pub journal: bool,
    /// Accepted for compatibility.  The driver exposes no fsync write option.
    pub fsync: bool,
}

impl Durability {
    /// Remove `readConcern`, `writeConcern`, `journal` and `fsync` from `url`.
    pub fn from_url(url: &mut Url) -> Result<Self, Error> {
        let read = match take_query_param(url, "readConcern")
            .map(|s| s.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("") | Some("majority") => ReadLevel::Majority,
            Some("local") => ReadLevel::Local,
            Some("linearizable") => ReadLevel::Linearizable,
            Some(other) => {
                return Err(Error::Endpoint {
                    what: format!("readConcern={other} is not supported"),
                });
            }
        };
        let write = match take_query_param(url, "writeConcern")
            .map(|s| s.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("") | Some("majority") => WriteLevel::Majority,
            Some(other) => match other.parse::<u32>() {
                Ok(nodes) => WriteLevel::Nodes(nodes),
                Err(_) => {
                    return Err(Error::Endpoint {
                        what: format!("writeConcern={other} is not supported"),
                    });
                }
            },
        };
        let journal = parse_flag("journal", take_query_param(url, "journal").as_deref())?;
        let fsync = parse_flag("fsync", take_query_param(url, "fsync").as_deref())?;
        Ok(Self {
            read,
            write,
            journal,
            fsync,
        })
    }

    /// The read concern applied to the client.
    pub fn read_concern(&self) -> ReadConcern {
        match self.read {
            ReadLevel::Majority => ReadConcern::majority(),
            ReadLevel::Local => ReadConcern::local(),
            ReadLevel::Linearizable => ReadConcern::linearizable(),
        }
    }

    /// The write concern applied to the client.
    pub fn write_concern(&self) -> WriteConcern {
        let mut write_concern = WriteConcern::default();
        write_concern.w = Some(match self.write {
            WriteLevel::Majority => Acknowledgment::Majority,
            WriteLevel::Nodes(nodes) => Acknowledgment::Nodes(nodes),
        });
        if self.journal {
            write_concern.journal = Some(true);
        }
        write_concern
    }
}

/// The database named by the endpoint's path.
fn database_name(url: &Url) -> Result<String, Error> {
    let name = url.path().trim_start_matches('/');
    if name.is_empty() {
        Err(Error::Endpoint {
            what: "mongodb endpoint names no database".to_string(),
        })
    } else {
        Ok(name.to_string())
    }
}

async fn scan(collection: &Collection<Document>) -> Result<u64, Error> {
    let filter = doc! {
        "age": { "$gt": i32::from(RANGE_AGE_LOWER), "$lt": i32::from(RANGE_AGE_UPPER) },
    };
    let mut cursor = collection.find(filter, None).await?;
    let mut count = 0;
    while let Some(doc) = cursor.try_next().await? {
        Record::try_from(&doc)?;
        count += 1;
    }
    Ok(count)
}

async fn find_most_recent(collection: &Collection<Document>) -> Result<Option<Document>, Error> {
    let options = FindOneOptions::builder().sort(doc! { "_id": -1 }).build();
    Ok(collection.find_one(doc! {}, options).await?)
}

/////////////////////////////////////////// MongoProvider //////////////////////////////////////////

/// A provider storing each record as one document keyed by `_id`.
pub struct MongoProvider {
    client: BlockingClient,
    collection: Collection<Document>,
}

impl MongoProvider {
    /// Parse the knobs, connect, ping, and open the collection.
    pub fn new(mut endpoint: Url, table: &str, options: &ConnectOptions) -> Result<Self, Error> {
        let durability = Durability::from_url(&mut endpoint)?;
        let database = database_name(&endpoint)?;
        if durability.fsync {
            clue!(COLLECTOR, INFO, {
                ignored: "fsync",
            });
        }
        let client = BlockingClient::new("mongo", options.timeout)?;
        let mut client_options = client
            .setup(ClientOptions::parse(endpoint.as_str()))
            .map_err(|err| Error::Endpoint {
                what: err.to_string(),
            })?;
        client_options.read_concern = Some(durability.read_concern());
        client_options.write_concern = Some(durability.write_concern());
        client_options.max_pool_size = Some(options.pool_size.max(1));
        client_options.connect_timeout = Some(options.timeout);
        client_options.server_selection_timeout = Some(options.timeout);
        let mongo = client
            .setup(async { Client::with_options(client_options) })
            .map_err(|err| Error::Connect {
                what: err.to_string(),
            })?;
        let db = mongo.database(&database);
        client
            .setup(db.run_command(doc! { "ping": 1 }, None))
            .map_err(|err| Error::Ping {
                what: err.to_string(),
            })?;
        if options.create_table {
            let existing = client
                .setup(db.list_collection_names(doc! { "name": table }))
                .map_err(|err| Error::Schema {
                    what: err.to_string(),
                })?;
            if existing.is_empty() {
                client
                    .setup(db.create_collection(table, None))
                    .map_err(|err| Error::Schema {
                        what: err.to_string(),
                    })?;
            }
        }
        clue!(COLLECTOR, INFO, {
            mongo: database.as_str(),
            collection: table,
        });
        Ok(Self {
            client,
            collection: db.collection::<Document>(table),
        })
    }

    fn insert(&self, record: &Record) -> Result<(), Error> {
        let doc = record.to_document()?;
        self.client.call(self.collection.insert_one(doc, None))?;
        Ok(())
    }

    fn update(&self, id: u64, balance: f64) -> Result<(), Error> {
        let key = i64::try_from(id).map_err(|_| Error::Backend {
            what: format!("id {id} does not fit a bson int64"),
        })?;
        let done = self.client.call(self.collection.update_one(
            doc! { "_id": key },
            doc! { "$set": { "balance": balance } },
            None,
        ))?;
        if done.matched_count == 0 {
            update_missed(id);
        }
        Ok(())
    }

    fn read(&self, id: u64) -> Result<Record, Error> {
        let key = i64::try_from(id).map_err(|_| Error::Backend {
            what: format!("id {id} does not fit a bson int64"),
        })?;
        let doc = self
            .client
            .call(self.collection.find_one(doc! { "_id": key }, None))?
            .ok_or(Error::NotFound { id })?;
        Record::try_from(&doc)
    }

    fn most_recent(&self) -> Result<Record, Error> {
        let doc = self
            .client
            .call(find_most_recent(&self.collection))?
            .ok_or(Error::EmptyBackend)?;
        Record::try_from(&doc)
    }
}

impl Provider for MongoProvider {
    fn name(&self) -> &'static str {
        "mongo"
    }

    fn insert_record(&self, record: &mut Record, ids: &IdGenerator, guac: &mut Guacamole) -> bool {
        record.randomise(guac);
        record.id = ids.get_new();
        outcome(Operation::Insert, Some(record.id), self.insert(record))
    }

    fn update_record(&self, _: &mut Record, ids: &IdGenerator, guac: &mut Guacamole) -> bool {
        let Some(id) = sample_existing(Operation::Update, ids, guac) else {
            return false;
        };
        let balance = random_balance(guac);
        outcome(Operation::Update, Some(id), self.update(id, balance))
    }

    fn read_record(&self, _: &mut Record, ids: &IdGenerator, guac: &mut Guacamole) -> bool {
        let Some(id) = sample_existing(Operation::Read, ids, guac) else {
            return false;
        };
        outcome(Operation::Read, Some(id), self.read(id))
    }

    fn read_range(&self, _: &mut Record, _: &IdGenerator, _: &mut Guacamole) -> bool {
        let result = self.client.call(scan(&self.collection));
        outcome(Operation::ReadRange, None, result)
    }

    fn read_most_recent_record(&self, _: &mut Record, _: &IdGenerator, _: &mut Guacamole) -> bool {
        outcome(Operation::ReadMostRecent, None, self.most_recent())
    }

    fn get_max_id(&self) -> Result<u64, Error> {
        let doc = self
            .client
            .call(find_most_recent(&self.collection))?
            .ok_or(Error::EmptyBackend)?;
        match doc.get_i64("_id")? {
            0 => Err(Error::EmptyBackend),
            id => u64::try_from(id).map_err(|_| Error::Decode {
                what: format!("negative _id {id}"),
            }),
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
