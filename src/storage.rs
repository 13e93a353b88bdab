//! Chart object storage.
//!
//! Keys handed to a [`Storage`] are relative to the configured prefix, e.g.
//! `mychart-1.0.0.tgz` or `team/mychart-1.0.0.tgz`.

use anyhow::Result;
use aws_config::SdkConfig;
use aws_sdk_s3::{primitives::ByteStream, types::ServerSideEncryption};
use std::sync::Arc;

use crate::{config::StorageConfig, handler::BoxFuture};

pub trait Storage: Send + Sync + 'static {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>>;

    fn put<'a>(&'a self, key: &'a str, data: Vec<u8>) -> BoxFuture<'a, Result<()>>;

    /// Returns false if there was nothing to delete.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>>;

    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>>;
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        (**self).get(key)
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        (**self).exists(key)
    }

    fn put<'a>(&'a self, key: &'a str, data: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        (**self).put(key, data)
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        (**self).delete(key)
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        (**self).list()
    }
}

#[derive(Clone, Debug)]
pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    sse: Option<ServerSideEncryption>,
}

impl S3Storage {
    /// Build the S3 client, applying the region and endpoint overrides on top
    /// of whatever the ambient AWS configuration says. A custom endpoint
    /// (MinIO and friends) gets path-style addressing.
    pub fn new(sdk_config: &SdkConfig, cfg: &StorageConfig) -> Self {
        let mut builder = aws_sdk_s3::config::Builder::from(sdk_config);

        if let Some(region) = &cfg.region {
            builder = builder.region(aws_sdk_s3::config::Region::new(region.clone()));
        }

        if let Some(endpoint) = &cfg.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        S3Storage {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: cfg.bucket.clone(),
            prefix: cfg.prefix.clone(),
            sse: cfg.sse.as_deref().map(ServerSideEncryption::from),
        }
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }
}

impl Storage for S3Storage {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let result = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(self.full_key(key))
                .send()
                .await;

            let mut result = match result {
                Ok(r) => r,
                Err(e) => {
                    let e = e.into_service_error();
                    if e.is_no_such_key() {
                        return Ok(None);
                    }
                    return Err(e.into());
                }
            };

            let mut data = Vec::new();

            while let Some(bytes) = result.body.try_next().await? {
                data.extend_from_slice(&bytes);
            }

            Ok(Some(data))
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let result = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(self.full_key(key))
                .send()
                .await;

            match result {
                Ok(_) => Ok(true),
                Err(e) => {
                    let e = e.into_service_error();
                    if e.is_not_found() {
                        Ok(false)
                    } else {
                        Err(e.into())
                    }
                }
            }
        })
    }

    fn put<'a>(&'a self, key: &'a str, data: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(self.full_key(key))
                .set_server_side_encryption(self.sse.clone())
                .body(ByteStream::from(data))
                .send()
                .await?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            // S3 deletes succeed whether or not the object was there.
            if !self.exists(key).await? {
                return Ok(false);
            }

            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(self.full_key(key))
                .send()
                .await?;
            Ok(true)
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let list_prefix = if self.prefix.is_empty() {
                None
            } else {
                Some(format!("{}/", self.prefix))
            };

            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(list_prefix.clone())
                .into_paginator()
                .send();

            let mut keys = Vec::new();

            while let Some(page) = pages.next().await {
                for obj in page?.contents() {
                    let Some(key) = obj.key() else {
                        continue;
                    };

                    let rel = match &list_prefix {
                        Some(p) => key.strip_prefix(p.as_str()).unwrap_or(key),
                        None => key,
                    };

                    keys.push(rel.to_owned());
                }
            }

            Ok(keys)
        })
    }
}
